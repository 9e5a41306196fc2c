//! Backend adapter contract
//!
//! The shared store provides storage, expiry and atomic scripting. Callers
//! never see how a backend reaches it; everything goes through [`Backend`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::script::Script;

/// Reply of a script execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Script returned nothing (Lua `nil`/`false`)
    Nil,
    /// Integer result
    Integer(i64),
    /// String result
    Text(String),
    /// Table result
    List(Vec<Reply>),
}

impl Reply {
    /// Integer value, if the reply is an integer
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Operations the shared key-value store must provide
///
/// All methods are safe to call concurrently from many tasks.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, optionally with a TTL (`None` keeps it forever)
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Clear the TTL of a key. Returns whether a TTL was removed.
    async fn persist(&self, key: &str) -> Result<bool>;

    /// Set the TTL of an existing key. Returns whether the key exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Run an atomic script against `keys` with `args`
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply>;

    /// Delete `key` only if it currently holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let reply = self
            .eval(
                &crate::script::COMPARE_AND_DELETE,
                &[key.to_string()],
                &[expected.to_string()],
            )
            .await?;
        Ok(reply.as_integer().unwrap_or(0) > 0)
    }
}
