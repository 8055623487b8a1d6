pub mod coordinator;
pub mod presence;
