use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// Cloneable handle over a reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// A connection for one command or pipeline. Clones share the underlying socket.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}
