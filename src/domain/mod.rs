pub mod conversation;
pub mod message;
pub mod presence;
pub mod profile;
