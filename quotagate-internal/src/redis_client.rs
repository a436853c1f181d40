use redis::aio::MultiplexedConnection;

use crate::error::{Error, ErrorDetails};

/// Shared Redis handle for the usage record store and the subscription
/// oracle. Connecting is eager so a bad URL fails at startup, not on the
/// first admission check.
pub struct RedisClient {
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to Redis: {e}");
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        tracing::info!("Connected to Redis");
        Ok(Self { conn })
    }

    /// A connection for store and oracle operations. Multiplexed
    /// connections are cheap to clone and share one underlying pipe.
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}
