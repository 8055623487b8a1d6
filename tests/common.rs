use alumnet_messaging::config::CoordinatorConfig;
use alumnet_messaging::domain::profile::{ProfileCard, ProfileDirectory, StaticProfileDirectory};
use alumnet_messaging::services::coordinator::Coordinator;
use alumnet_messaging::storage::MessageStore;
use alumnet_messaging::storage::feed::FeedStore;
use alumnet_messaging::storage::memory::InMemoryMessageStore;
use alumnet_messaging::transport::ChannelTransport;
use alumnet_messaging::transport::local::{LocalHub, LocalTransport};
use std::sync::{Arc, Once};
use tokio::sync::watch;
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("alumnet_messaging=debug".parse().unwrap());
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// Two-or-more-session test environment: one shared in-memory store and one
/// in-process hub, with each session holding its own transport handle and
/// coordinator.
pub struct TestEnv {
    pub hub: Arc<LocalHub>,
    pub store: Arc<InMemoryMessageStore>,
    pub profiles: Arc<StaticProfileDirectory>,
    pub config: CoordinatorConfig,
}

impl TestEnv {
    pub fn new(cards: impl IntoIterator<Item = (Uuid, &'static str)>) -> Self {
        setup_tracing();
        let cards = cards.into_iter().map(|(id, name)| ProfileCard {
            id,
            display_name: name.to_string(),
            avatar_ref: None,
        });
        Self {
            hub: LocalHub::new(),
            store: Arc::new(InMemoryMessageStore::new()),
            profiles: Arc::new(StaticProfileDirectory::new(cards)),
            config: CoordinatorConfig::default(),
        }
    }

    /// Opens a coordinator session for `me`. The returned transport handle
    /// drives connection simulation; the watch sender shuts the session down.
    pub async fn open(&self, me: Uuid) -> Session {
        let transport = self.hub.transport();
        let transport_dyn: Arc<dyn ChannelTransport> = Arc::new(transport.clone());
        let store: Arc<dyn MessageStore> = Arc::new(FeedStore::new(
            Arc::clone(&self.store) as Arc<dyn MessageStore>,
            Arc::clone(&transport_dyn),
        ));
        let profiles: Arc<dyn ProfileDirectory> = Arc::clone(&self.profiles) as Arc<dyn ProfileDirectory>;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Coordinator::open(
            me,
            store,
            transport_dyn,
            profiles,
            &self.config,
            shutdown_rx,
        )
        .await
        .expect("coordinator open");

        Session { coordinator, transport, shutdown_tx }
    }
}

pub struct Session {
    pub coordinator: Coordinator,
    pub transport: LocalTransport,
    pub shutdown_tx: watch::Sender<bool>,
}

impl Session {
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Lets all in-flight events drain. Under a paused clock this completes as
/// soon as every task is idle.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
