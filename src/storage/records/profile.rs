use uuid::Uuid;

#[derive(sqlx::FromRow)]
pub(crate) struct ProfileRow {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl From<ProfileRow> for crate::domain::profile::ProfileCard {
    fn from(record: ProfileRow) -> Self {
        Self { id: record.id, display_name: record.display_name, avatar_ref: record.avatar_ref }
    }
}
