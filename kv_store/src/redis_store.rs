use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use tracing::{debug, warn};

use crate::{Command, Error, KvStore, MessageStream, Transaction};

/// Store backed by a Redis server.
///
/// Writes go through one multiplexed connection; each subscription opens its
/// own pub/sub connection.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|source| Error::ConnectionFailed {
            url: url.to_string(),
            source,
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|source| Error::ConnectionFailed {
                url: url.to_string(),
                source,
            })?;
        debug!(url, "connected to redis");
        Ok(Self { client, conn })
    }

    fn pipeline(txn: &Transaction) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in txn.commands() {
            match command {
                Command::Del { key } => {
                    pipe.del(key).ignore();
                }
                Command::HSet { key, fields } => {
                    pipe.hset_multiple(key, fields.as_slice()).ignore();
                }
                Command::HIncrBy { key, field, delta } => {
                    pipe.hincr(key, field, *delta).ignore();
                }
                Command::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                Command::SAdd { key, members } => {
                    pipe.sadd(key, members).ignore();
                }
                Command::SRem { key, members } => {
                    pipe.srem(key, members).ignore();
                }
                Command::Expire { key, ttl } => {
                    let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
                    pipe.expire(key, seconds).ignore();
                }
            }
        }
        pipe
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn exec(&self, txn: Transaction) -> Result<(), Error> {
        if txn.is_empty() {
            return Ok(());
        }
        let pipe = Self::pipeline(&txn);
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|source| Error::TransactionFailed {
                commands: txn.len(),
                source,
            })?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!("dropping undecodable pub/sub payload: {:?}", err);
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
