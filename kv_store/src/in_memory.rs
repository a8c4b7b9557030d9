use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use futures::{future, StreamExt};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::{Command, Error, KvStore, MessageStream, Transaction};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    rejected_keys: Vec<String>,
}

impl Inner {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            trace!(key, "expired");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn is_rejected(&self, key: &str) -> bool {
        self.rejected_keys.iter().any(|fragment| key.contains(fragment.as_str()))
    }
}

fn wrong_type(key: &str, expected: &'static str) -> Error {
    Error::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// Applies one command to a working copy of the touched keys.
fn apply(working: &mut HashMap<String, Option<Entry>>, command: &Command) -> Result<(), Error> {
    let slot = working.entry(command.key().to_string()).or_insert(None);
    match command {
        Command::Del { .. } => {
            *slot = None;
        }
        Command::HSet { key, fields } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key, "hash"));
            };
            hash.extend(fields.iter().cloned());
        }
        Command::HIncrBy { key, field, delta } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key, "hash"));
            };
            let current: i64 = match hash.get(field) {
                Some(v) => v.parse().map_err(|_| Error::NotAnInteger {
                    key: key.clone(),
                    field: field.clone(),
                })?,
                None => 0,
            };
            hash.insert(field.clone(), (current + delta).to_string());
        }
        Command::Set { value, .. } => {
            // a plain SET discards any previous expiry
            *slot = Some(Entry::new(Value::String(value.clone())));
        }
        Command::SAdd { key, members } => {
            let entry = slot.get_or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
            let Value::Set(set) = &mut entry.value else {
                return Err(wrong_type(key, "set"));
            };
            set.extend(members.iter().cloned());
        }
        Command::SRem { key, members } => {
            let Some(entry) = slot.as_mut() else {
                return Ok(());
            };
            let Value::Set(set) = &mut entry.value else {
                return Err(wrong_type(key, "set"));
            };
            for member in members {
                set.remove(member);
            }
            if set.is_empty() {
                *slot = None;
            }
        }
        Command::Expire { ttl, .. } => {
            if let Some(entry) = slot.as_mut() {
                entry.expires_at = Some(Instant::now() + *ttl);
            }
        }
    }
    Ok(())
}

/// A process-local store with Redis semantics for the commands the mirror
/// uses: lazily expiring keys, sets that vanish when emptied, and
/// broadcast-backed publish/subscribe.
///
/// Expiry follows `tokio::time`, so paused-clock tests can advance past a
/// TTL without sleeping.
///
/// A batch whose command fails at runtime (`WrongType`, `NotAnInteger`) is
/// discarded as a whole here. Redis `MULTI`/`EXEC` still applies the other
/// commands of such a batch, so tests must not rely on the rollback when
/// reasoning about what the production store leaves behind.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every transaction that touches a key containing `fragment` fail
    /// without applying any of its commands.
    pub async fn reject_writes_to(&self, fragment: &str) {
        self.inner.lock().await.rejected_keys.push(fragment.to_string());
    }

    pub async fn accept_all_writes(&self) {
        self.inner.lock().await.rejected_keys.clear();
    }

    /// Remaining time to live of `key`, `None` when it is missing or has no
    /// expiry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        let entry = inner.live(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// All live keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = inner.entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn exec(&self, txn: Transaction) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some(command) = txn.commands().iter().find(|c| inner.is_rejected(c.key())) {
            return Err(Error::Rejected {
                key: command.key().to_string(),
            });
        }

        let mut working: HashMap<String, Option<Entry>> = HashMap::new();
        for command in txn.commands() {
            let key = command.key();
            if !working.contains_key(key) {
                let current = inner.live(key).cloned();
                working.insert(key.to_string(), current);
            }
            apply(&mut working, command)?;
        }

        for (key, entry) in working {
            match entry {
                Some(entry) => {
                    inner.entries.insert(key, entry);
                }
                None => {
                    inner.entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, Error> {
        Ok(self.inner.lock().await.live(key).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, Error> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key, "hash")),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            None => Ok(vec![]),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut inner = self.inner.lock().await;
        if inner.is_rejected(key) {
            return Err(Error::Rejected {
                key: key.to_string(),
            });
        }
        let Some(entry) = inner.live(key) else {
            return Ok(false);
        };
        let Value::Set(set) = &mut entry.value else {
            return Err(wrong_type(key, "set"));
        };
        let removed = set.remove(member);
        if set.is_empty() {
            inner.entries.remove(key);
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), Error> {
        if let Some(tx) = self.channels.lock().await.get(channel) {
            // no subscribers is not an error, same as PUBLISH returning 0
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, Error> {
        let rx = self
            .channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|message| future::ready(message.ok()));
        Ok(Box::pin(stream))
    }
}
