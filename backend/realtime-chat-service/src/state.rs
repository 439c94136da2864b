use crate::{
    config::Config,
    error::{AppError, AppResult},
    middleware::{Authenticator, JwtAuthenticator},
    redis_client::RedisClient,
    services::{
        ack_tracker::{AckTracker, DeliveryStateStore, InMemoryDeliveryStore, RedisDeliveryStore},
        contacts::InMemoryContactDirectory,
        delivery_router::DeliveryRouter,
        idempotency::SendDeduplicator,
        key_directory::PgKeyDirectory,
        offline_queue::{InMemoryOfflineStore, OfflineQueue, OfflineStore, RedisOfflineStore},
        typing_relay::TypingRelay,
    },
    websocket::PresenceDirectory,
};
use crypto_core::{InMemoryKeyDirectory, KeyDirectory};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub presence: PresenceDirectory,
    pub router: DeliveryRouter,
    pub acks: AckTracker,
    pub typing: TypingRelay,
    pub dedup: Arc<SendDeduplicator>,
    pub keys: Arc<dyn KeyDirectory>,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        auth: Arc<dyn Authenticator>,
        offline_store: Arc<dyn OfflineStore>,
        delivery_store: Arc<dyn DeliveryStateStore>,
        keys: Arc<dyn KeyDirectory>,
    ) -> Self {
        let presence = PresenceDirectory::new(Arc::new(InMemoryContactDirectory::new()));
        let offline = OfflineQueue::new(offline_store, config.offline_retention);
        let acks = AckTracker::new(delivery_store, presence.clone());
        let router = DeliveryRouter::new(presence.clone(), offline, acks.clone());

        Self {
            typing: TypingRelay::new(presence.clone()),
            dedup: Arc::new(SendDeduplicator::new(config.send_dedup_window)),
            config,
            presence,
            router,
            acks,
            keys,
            auth,
        }
    }

    /// Every store in process memory.
    pub fn in_memory(config: Arc<Config>, auth: Arc<dyn Authenticator>) -> Self {
        let offline_retention = config.offline_retention;
        Self::new(
            config,
            auth,
            Arc::new(InMemoryOfflineStore::new()),
            Arc::new(InMemoryDeliveryStore::new(offline_retention)),
            Arc::new(InMemoryKeyDirectory::new()),
        )
    }

    /// Wire stores from configuration: Redis when `REDIS_URL` is set,
    /// Postgres for the key directory when `DATABASE_URL` is set.
    pub async fn from_config(config: Arc<Config>) -> AppResult<Self> {
        let auth: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::from_public_key_pem(
            &config.jwt_public_key_pem,
        )?);

        let (offline_store, delivery_store): (Arc<dyn OfflineStore>, Arc<dyn DeliveryStateStore>) =
            match &config.redis_url {
                Some(url) => {
                    let redis = RedisClient::from_url(url)
                        .await
                        .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;
                    tracing::info!("using redis for offline queue and delivery state");
                    (
                        Arc::new(RedisOfflineStore::new(redis.clone(), config.offline_retention)),
                        Arc::new(RedisDeliveryStore::new(redis, config.offline_retention)),
                    )
                }
                None => {
                    tracing::warn!("REDIS_URL not set; offline queue and delivery state are in-memory");
                    (
                        Arc::new(InMemoryOfflineStore::new()),
                        Arc::new(InMemoryDeliveryStore::new(config.offline_retention)),
                    )
                }
            };

        let keys: Arc<dyn KeyDirectory> = match &config.database_url {
            Some(url) => {
                let directory = PgKeyDirectory::connect(url)
                    .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
                directory
                    .ensure_schema()
                    .await
                    .map_err(|e| AppError::StartServer(format!("db schema: {e}")))?;
                tracing::info!("using postgres key directory");
                Arc::new(directory)
            }
            None => {
                tracing::warn!("DATABASE_URL not set; key directory is in-memory");
                Arc::new(InMemoryKeyDirectory::new())
            }
        };

        Ok(Self::new(config, auth, offline_store, delivery_store, keys))
    }
}
