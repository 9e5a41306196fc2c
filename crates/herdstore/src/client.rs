//! Backend client for Redis-compatible servers
//!
//! Speaks RESP2 over plain TCP. Connections are opened lazily and kept in a
//! small round-robin pool; a connection that fails mid-request is dropped and
//! re-opened on the next call that lands on its slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::backend::{Backend, Reply};
use crate::error::{Result, StoreError};
use crate::resp::RespValue;
use crate::script::Script;

/// Connection settings for [`RespBackend`]
#[derive(Debug, Clone)]
pub struct RespConfig {
    /// Server address (`host:port`)
    pub addr: String,
    /// Password sent with `AUTH` after connecting
    pub password: Option<String>,
    /// Logical database selected with `SELECT`
    pub database: Option<u32>,
    /// Number of pooled connections
    pub pool_size: usize,
    /// Limit for establishing a connection
    pub connect_timeout: Duration,
    /// Limit for one request/reply exchange
    pub io_timeout: Duration,
}

impl Default for RespConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            database: None,
            pool_size: 4,
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
        }
    }
}

struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    async fn open(config: &RespConfig) -> Result<Self> {
        let stream = match timeout(config.connect_timeout, TcpStream::connect(&config.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(StoreError::Unavailable(format!(
                    "connect to {} failed: {}",
                    config.addr, e
                )))
            }
            Err(_) => {
                return Err(StoreError::Unavailable(format!(
                    "connect to {} timed out",
                    config.addr
                )))
            }
        };
        stream.set_nodelay(true)?;
        debug!("Connected to {}", config.addr);

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
        };
        if let Some(password) = &config.password {
            conn.request(&RespValue::command(["AUTH", password.as_str()]))
                .await
                .and_then(expect_ok)?;
        }
        if let Some(db) = config.database {
            conn.request(&RespValue::command(["SELECT".to_string(), db.to_string()]))
                .await
                .and_then(expect_ok)?;
        }
        Ok(conn)
    }

    async fn request(&mut self, cmd: &RespValue) -> Result<RespValue> {
        self.stream.write_all(&cmd.to_bytes()).await?;
        loop {
            if let Some(reply) = RespValue::decode(&mut self.buffer)? {
                return Ok(reply);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(StoreError::Unavailable(
                    "connection closed by server".into(),
                ));
            }
        }
    }
}

/// [`Backend`] backed by a Redis-compatible server
pub struct RespBackend {
    config: RespConfig,
    pool: Vec<Mutex<Option<Connection>>>,
    next: AtomicUsize,
}

impl RespBackend {
    /// Create a client; connections are opened on first use
    pub fn new(config: RespConfig) -> Self {
        let size = config.pool_size.max(1);
        Self {
            config,
            pool: (0..size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Create a client and verify the server answers `PING`
    pub async fn connect(config: RespConfig) -> Result<Self> {
        let backend = Self::new(config);
        backend.ping().await?;
        Ok(backend)
    }

    /// Server address this client talks to
    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    /// Round-trip a `PING`
    pub async fn ping(&self) -> Result<()> {
        match self.call(RespValue::command(["PING"])).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    async fn call(&self, cmd: RespValue) -> Result<RespValue> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let mut guard = self.pool[slot].lock().await;
        if guard.is_none() {
            *guard = Some(Connection::open(&self.config).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Unavailable("no connection".into()));
        };

        match timeout(self.config.io_timeout, conn.request(&cmd)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                // The stream may hold half a frame; never reuse it
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(StoreError::Unavailable(format!(
                    "request to {} timed out",
                    self.config.addr
                )))
            }
        }
    }

    async fn call_integer(&self, name: &str, cmd: RespValue) -> Result<i64> {
        match self.call(cmd).await? {
            RespValue::Integer(n) => Ok(n),
            other => Err(unexpected(name, &other)),
        }
    }
}

fn millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

fn expect_ok(reply: RespValue) -> Result<()> {
    match reply {
        RespValue::SimpleString(s) if s == "OK" => Ok(()),
        other => Err(unexpected("command", &other)),
    }
}

fn unexpected(name: &str, reply: &RespValue) -> StoreError {
    match reply {
        RespValue::Error(e) => StoreError::Protocol(format!("{} failed: {}", name, e)),
        other => StoreError::Protocol(format!("unexpected reply to {}: {:?}", name, other)),
    }
}

#[async_trait]
impl Backend for RespBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.call(RespValue::command(["GET", key])).await? {
            RespValue::BulkString(None) => Ok(None),
            reply @ RespValue::BulkString(Some(_)) => Ok(reply.as_text()),
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let cmd = match ttl {
            Some(ttl) => RespValue::command(["SET", key, value, "PX", millis(ttl).as_str()]),
            None => RespValue::command(["SET", key, value]),
        };
        self.call(cmd).await.and_then(expect_ok)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.call_integer("DEL", RespValue::command(["DEL", key])).await? > 0)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        Ok(self
            .call_integer("PERSIST", RespValue::command(["PERSIST", key]))
            .await?
            > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let cmd = RespValue::command(["PEXPIRE", key, millis(ttl).as_str()]);
        Ok(self.call_integer("PEXPIRE", cmd).await? > 0)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let cmd = RespValue::command(["SET", key, value, "NX", "PX", millis(ttl).as_str()]);
        match self.call(cmd).await? {
            RespValue::SimpleString(s) if s == "OK" => Ok(true),
            RespValue::BulkString(None) => Ok(false),
            other => Err(unexpected("SET NX", &other)),
        }
    }

    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply> {
        let mut parts = Vec::with_capacity(3 + keys.len() + args.len());
        parts.push("EVAL".to_string());
        parts.push(script.source().to_string());
        parts.push(keys.len().to_string());
        parts.extend(keys.iter().cloned());
        parts.extend(args.iter().cloned());
        self.call(RespValue::command(parts)).await?.into_reply()
    }
}
