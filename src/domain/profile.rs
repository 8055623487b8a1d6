use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Display identity used to decorate conversation entries and thread headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileCard {
    pub id: Uuid,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl ProfileCard {
    /// Fallback identity used when a lookup fails or has not resolved yet.
    /// Profile lookup failures degrade the display, never block messaging.
    #[must_use]
    pub fn placeholder(id: Uuid) -> Self {
        Self { id, display_name: "Alumni member".to_string(), avatar_ref: None }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.display_name == "Alumni member" && self.avatar_ref.is_none()
    }
}

/// Directory of participant display identities.
#[async_trait]
pub trait ProfileDirectory: Send + Sync + std::fmt::Debug {
    /// Resolves display identities for the given ids. Ids with no profile
    /// row are simply absent from the result.
    ///
    /// # Errors
    /// Returns `AppError::Read` if the lookup fails.
    async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<ProfileCard>>;
}

/// Fixed in-memory directory, used by tests and demos.
#[derive(Debug, Default)]
pub struct StaticProfileDirectory {
    cards: std::collections::HashMap<Uuid, ProfileCard>,
}

impl StaticProfileDirectory {
    #[must_use]
    pub fn new(cards: impl IntoIterator<Item = ProfileCard>) -> Self {
        Self { cards: cards.into_iter().map(|c| (c.id, c)).collect() }
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfileDirectory {
    async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<ProfileCard>> {
        Ok(ids.iter().filter_map(|id| self.cards.get(id).cloned()).collect())
    }
}
