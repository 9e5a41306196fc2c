//! In-process backend
//!
//! Keeps every entry in one map guarded by a single mutex. Expiry is measured
//! on the tokio clock, so tests running with a paused clock can step through
//! TTLs. Scripts are executed natively while the mutex is held, which makes
//! each script indivisible with respect to every other operation.

use std::collections::HashMap;
use std::time::Duration;

use ahash::RandomState;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::backend::{Backend, Reply};
use crate::error::{Result, StoreError};
use crate::script::{
    Script, COMPARE_AND_DELETE, DEDUCT, DEDUCT_MANY, RENEW_LEASE, RESTORE, RESTORE_MANY, SETTLE,
};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

type Entries = HashMap<String, Entry, RandomState>;

/// Backend holding all data in process memory
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<Entries>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Check if no live entries remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a live entry exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        View::new(&mut entries).get(key).is_some()
    }

    /// Remaining TTL of `key`; `None` when the key is absent or never expires
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn run_script(view: &mut View<'_>, script: &Script, keys: &[String], args: &[String]) -> Result<Reply> {
        match *script {
            s if s == COMPARE_AND_DELETE => {
                let key = arg(keys, 0, "KEYS")?;
                let expected = arg(args, 0, "ARGV")?;
                if view.get(key) == Some(expected) {
                    view.entries.remove(key);
                    Ok(Reply::Integer(1))
                } else {
                    Ok(Reply::Integer(0))
                }
            }
            s if s == RENEW_LEASE => {
                let key = arg(keys, 0, "KEYS")?;
                let expected = arg(args, 0, "ARGV")?;
                let ttl_ms: u64 = arg(args, 1, "ARGV")?
                    .parse()
                    .map_err(|_| StoreError::Script("ERR value is not an integer".into()))?;
                if view.get(key) != Some(expected) {
                    return Ok(Reply::Integer(0));
                }
                let now = view.now;
                if let Some(entry) = view.entries.get_mut(key) {
                    entry.expires_at = Some(now + Duration::from_millis(ttl_ms));
                }
                Ok(Reply::Integer(1))
            }
            s if s == DEDUCT => {
                let stock_key = arg(keys, 0, "KEYS")?;
                let reserved_key = arg(keys, 1, "KEYS")?;
                let stock = view.number(stock_key);
                if stock == -1 {
                    return Ok(Reply::Integer(-1));
                }
                match args.first().and_then(|a| a.parse::<i64>().ok()) {
                    Some(amount) if amount > 0 && stock >= amount => {
                        view.decr_by(stock_key, amount)?;
                        view.incr_by(reserved_key, amount)?;
                        Ok(Reply::Integer(1))
                    }
                    _ => Ok(Reply::Integer(0)),
                }
            }
            s if s == RESTORE => {
                let stock_key = arg(keys, 0, "KEYS")?;
                let reserved_key = arg(keys, 1, "KEYS")?;
                if view.number(stock_key) == -1 {
                    return Ok(Reply::Integer(-1));
                }
                let reserved = view.number(reserved_key);
                match args.first().and_then(|a| a.parse::<i64>().ok()) {
                    Some(amount) if amount > 0 && reserved >= amount => {
                        view.decr_by(reserved_key, amount)?;
                        view.incr_by(stock_key, amount)?;
                        Ok(Reply::Integer(1))
                    }
                    _ => Ok(Reply::Integer(0)),
                }
            }
            s if s == DEDUCT_MANY => {
                require_pairs(keys)?;
                for (i, pair) in keys.chunks(2).enumerate() {
                    let stock = view.number(&pair[0]);
                    if stock != -1 && stock < amount_at(args, i) {
                        return Ok(Reply::Integer(0));
                    }
                }
                for (i, pair) in keys.chunks(2).enumerate() {
                    let amount = amount_at(args, i);
                    if view.number(&pair[0]) != -1 && amount != 0 {
                        view.decr_by(&pair[0], amount)?;
                        view.incr_by(&pair[1], amount)?;
                    }
                }
                Ok(Reply::Integer(1))
            }
            s if s == RESTORE_MANY => {
                require_pairs(keys)?;
                for (i, pair) in keys.chunks(2).enumerate() {
                    let stock = view.number(&pair[0]);
                    if stock != -1 && view.number(&pair[1]) < amount_at(args, i) {
                        return Ok(Reply::Integer(0));
                    }
                }
                for (i, pair) in keys.chunks(2).enumerate() {
                    let amount = amount_at(args, i);
                    if view.number(&pair[0]) != -1 && amount != 0 {
                        view.decr_by(&pair[1], amount)?;
                        view.incr_by(&pair[0], amount)?;
                    }
                }
                Ok(Reply::Integer(1))
            }
            s if s == SETTLE => {
                for (i, key) in keys.iter().enumerate() {
                    if view.number(key) < amount_at(args, i) {
                        return Ok(Reply::Integer(0));
                    }
                }
                for (i, key) in keys.iter().enumerate() {
                    let amount = amount_at(args, i);
                    if amount != 0 {
                        view.decr_by(key, amount)?;
                    }
                }
                Ok(Reply::Integer(1))
            }
            other => Err(StoreError::Script(format!(
                "script '{}' is not supported by the memory backend",
                other.name()
            ))),
        }
    }
}

/// Mutable view of the map at a fixed instant; purges expired entries it touches
struct View<'a> {
    entries: &'a mut Entries,
    now: Instant,
}

impl<'a> View<'a> {
    fn new(entries: &'a mut Entries) -> Self {
        Self {
            entries,
            now: Instant::now(),
        }
    }

    fn get(&mut self, key: &str) -> Option<&str> {
        let live = self.entries.get(key).map(|e| e.is_live(self.now));
        if live == Some(false) {
            self.entries.remove(key);
        }
        self.entries
            .get(key)
            .filter(|e| e.is_live(self.now))
            .map(|e| e.value.as_str())
    }

    /// Numeric reading of a counter; absent or non-numeric reads as zero
    fn number(&mut self, key: &str) -> i64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// INCRBY semantics: missing keys start at zero, existing TTL is kept
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.apply(key, |current| current.checked_add(delta))
    }

    /// DECRBY semantics
    fn decr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        self.apply(key, |current| current.checked_sub(delta))
    }

    fn apply(&mut self, key: &str, step: impl FnOnce(i64) -> Option<i64>) -> Result<i64> {
        let current = match self.get(key) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| StoreError::Script("ERR value is not an integer or out of range".into()))?,
            None => 0,
        };
        let next = step(current)
            .ok_or_else(|| StoreError::Script("ERR increment or decrement would overflow".into()))?;
        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }
}

fn arg<'s>(items: &'s [String], index: usize, what: &str) -> Result<&'s str> {
    items
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Script(format!("missing {}[{}]", what, index + 1)))
}

fn require_pairs(keys: &[String]) -> Result<()> {
    if keys.len() % 2 != 0 {
        return Err(StoreError::Script(
            "keys must come in (stock, reserved) pairs".into(),
        ));
    }
    Ok(())
}

fn amount_at(args: &[String], index: usize) -> i64 {
    args.get(index).and_then(|a| a.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(View::new(&mut entries).get(key).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let existed = View::new(&mut entries).get(key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if View::new(&mut entries).get(key).is_none() {
            return Ok(false);
        }
        Ok(entries
            .get_mut(key)
            .and_then(|e| e.expires_at.take())
            .is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let mut view = View::new(&mut entries);
        if view.get(key).is_none() {
            return Ok(false);
        }
        let at = view.now + ttl;
        if let Some(entry) = view.entries.get_mut(key) {
            entry.expires_at = Some(at);
        }
        Ok(true)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        let mut view = View::new(&mut entries);
        if view.get(key).is_some() {
            return Ok(false);
        }
        let at = view.now + ttl;
        view.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(at),
            },
        );
        Ok(true)
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply> {
        let mut entries = self.entries.lock();
        let saved: Vec<(String, Option<Entry>)> = keys
            .iter()
            .map(|k| (k.clone(), entries.get(k).cloned()))
            .collect();
        let mut view = View::new(&mut entries);
        let reply = Self::run_script(&mut view, script, keys, args);
        if reply.is_err() {
            // a failed script leaves its keys as they were
            for (key, entry) in saved {
                match entry {
                    Some(entry) => entries.insert(key, entry),
                    None => entries.remove(&key),
                };
            }
        }
        reply
    }
}
