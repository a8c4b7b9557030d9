//! The key-value store capability the mirror writes through.
//!
//! Writes are grouped into a [`Transaction`], a batch of commands that the
//! store applies atomically. Atomicity covers one batch only; a caller that
//! issues several batches in sequence gets no rollback if a later batch
//! fails. Redis does not roll back a batch whose command fails at runtime
//! either; see [`InMemoryStore`] for where the test store differs.
//!
//! Two implementations are provided: [`RedisStore`] for production and
//! [`InMemoryStore`], a TTL-aware store used by tests and dry runs.

use std::{collections::HashMap, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::Stream;

pub mod in_memory;
pub mod redis_store;

pub use in_memory::InMemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to connect to the store at {}. error: {}", url, source)]
    ConnectionFailed {
        url: String,
        source: redis::RedisError,
    },

    #[error("Store transaction of {} commands failed. error: {}", commands, source)]
    TransactionFailed {
        commands: usize,
        source: redis::RedisError,
    },

    #[error("Key {} holds a value of the wrong type, expected a {}", key, expected)]
    WrongType { key: String, expected: &'static str },

    #[error("Hash field {} of {} is not an integer", field, key)]
    NotAnInteger { key: String, field: String },

    #[error("Store rejected the write to {}", key)]
    Rejected { key: String },

    #[error(transparent)]
    Redis {
        #[from]
        source: redis::RedisError,
    },
}

/// A single write inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Del {
        key: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    Set {
        key: String,
        value: String,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl Command {
    pub fn key(&self) -> &str {
        match self {
            Command::Del { key }
            | Command::HSet { key, .. }
            | Command::HIncrBy { key, .. }
            | Command::Set { key, .. }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::Expire { key, .. } => key,
        }
    }
}

/// An ordered batch of commands applied atomically by [`KvStore::exec`].
///
/// The builder methods mirror a Redis `MULTI` block. Set and hash commands
/// with nothing to write are dropped, since the store rejects empty ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<Command>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn hset_multiple(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        if !fields.is_empty() {
            self.commands.push(Command::HSet {
                key: key.into(),
                fields,
            });
        }
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.hset_multiple(key, vec![(field.into(), value.into())])
    }

    pub fn hincr_by(&mut self, key: impl Into<String>, field: impl Into<String>, delta: i64) -> &mut Self {
        self.commands.push(Command::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn sadd<I, M>(&mut self, key: impl Into<String>, members: I) -> &mut Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if !members.is_empty() {
            self.commands.push(Command::SAdd {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn srem<I, M>(&mut self, key: impl Into<String>, members: I) -> &mut Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        let members: Vec<String> = members.into_iter().map(Into::into).collect();
        if !members.is_empty() {
            self.commands.push(Command::SRem {
                key: key.into(),
                members,
            });
        }
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.commands.push(Command::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Store operations the mirror relies on: atomic batches, set membership,
/// hash fields, expiry and publish/subscribe.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Applies every command of `txn` atomically.
    async fn exec(&self, txn: Transaction) -> Result<(), Error>;

    async fn exists(&self, key: &str) -> Result<bool, Error>;

    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;

    /// Removes `member` from the set at `key`, returning whether it was there.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), Error>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, Error>;
}
