//! herdctl subcommands

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use herdcache::{BloomFilter, CacheConfig, CacheLock, DistributedLock, Error, KeyTemplate};
use herdstore::{Backend, Ledger, LedgerOutcome, StockPair};

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the server answers
    Ping,

    /// Read a key
    Get { key: String },

    /// Write a key
    Set {
        key: String,
        value: String,
        /// Expiry in seconds (none keeps the key forever)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Delete a key
    Del { key: String },

    /// Stock ledger scripts
    #[command(subcommand)]
    Stock(StockCommand),

    /// Distributed lease inspection
    #[command(subcommand)]
    Lock(LockCommand),

    /// Print bloom filter sizing for a member count and false-positive rate
    BloomSize {
        #[arg(long, default_value_t = 10_000)]
        items: usize,
        #[arg(long, default_value_t = 0.01)]
        fpr: f64,
    },

    /// Render a cache key from a template
    Key {
        template: String,
        /// Template argument as name=value (repeatable)
        #[arg(long = "arg", value_parser = parse_arg)]
        args: Vec<(String, String)>,
        /// Inserted for arguments that are not given
        #[arg(long, default_value = "")]
        default: String,
        /// Namespace tag hashed into the key
        #[arg(long, default_value = "")]
        namespace: String,
    },

    /// Print the effective cache configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum StockCommand {
    /// Move units from stock to reserved
    Deduct { stock: String, reserved: String, amount: i64 },

    /// Move units from reserved back to stock
    Restore { stock: String, reserved: String, amount: i64 },

    /// All-or-nothing deduct over several pairs
    DeductMany {
        /// stock:reserved key pair (repeatable)
        #[arg(long = "pair", value_parser = parse_pair, required = true)]
        pairs: Vec<StockPair>,
        /// Amount per pair, in the same order (repeatable)
        #[arg(long = "amount", required = true)]
        amounts: Vec<i64>,
    },

    /// All-or-nothing restore over several pairs
    RestoreMany {
        #[arg(long = "pair", value_parser = parse_pair, required = true)]
        pairs: Vec<StockPair>,
        #[arg(long = "amount", required = true)]
        amounts: Vec<i64>,
    },

    /// Consume reserved units for good
    Settle {
        /// Reserved counter key (repeatable)
        #[arg(long = "reserved", required = true)]
        reserved: Vec<String>,
        #[arg(long = "amount", required = true)]
        amounts: Vec<i64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Try to take and immediately give back the lease of a key
    Probe { key: String },

    /// Release a lease held under a known token
    Release { key: String, lease_id: String },
}

impl Command {
    /// Whether the command runs without contacting the server
    pub fn is_offline(&self) -> bool {
        matches!(
            self,
            Command::BloomSize { .. } | Command::Key { .. } | Command::Config
        )
    }
}

fn parse_arg(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

fn parse_pair(s: &str) -> std::result::Result<StockPair, String> {
    match s.split_once(':') {
        Some((stock, reserved)) if !stock.is_empty() && !reserved.is_empty() => {
            Ok(StockPair::new(stock, reserved))
        }
        _ => Err(format!("expected stock:reserved, got '{}'", s)),
    }
}

fn outcome(outcome: LedgerOutcome) -> String {
    match outcome {
        LedgerOutcome::Applied => "applied".to_string(),
        LedgerOutcome::Unlimited => "unlimited".to_string(),
        LedgerOutcome::Rejected => "rejected".to_string(),
    }
}

/// Run a command that needs no server
pub fn run_offline(command: &Command, config: &CacheConfig) -> Result<String> {
    match command {
        Command::BloomSize { items, fpr } => {
            if !(*fpr > 0.0 && *fpr < 1.0) {
                bail!("fpr must be in (0, 1), got {}", fpr);
            }
            let bits = BloomFilter::optimal_bits(*items, *fpr);
            let filter = BloomFilter::with_params(bits, config.bloom.hash_count);
            Ok(format!(
                "bits: {}\nwords: {}\nbytes: {}\nhashes: {}",
                filter.num_bits(),
                filter.num_words(),
                filter.num_words() * 8,
                filter.hash_count()
            ))
        }
        Command::Key {
            template,
            args,
            default,
            namespace,
        } => {
            let template = KeyTemplate::parse(template)?;
            let args: Vec<(&str, &str)> = args.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            Ok(template.key(&args, default, namespace).to_string())
        }
        Command::Config => Ok(serde_json::to_string_pretty(config)?),
        _ => bail!("command needs a server connection"),
    }
}

/// Run a command against the server
pub async fn run(command: &Command, backend: Arc<dyn Backend>, config: &CacheConfig) -> Result<String> {
    match command {
        Command::Ping => {
            backend.get("herdctl:ping").await.context("server did not answer")?;
            Ok("PONG".to_string())
        }
        Command::Get { key } => Ok(backend
            .get(key)
            .await?
            .unwrap_or_else(|| "(nil)".to_string())),
        Command::Set {
            key,
            value,
            ttl_secs,
        } => {
            backend
                .set(key, value, ttl_secs.map(Duration::from_secs))
                .await?;
            Ok("OK".to_string())
        }
        Command::Del { key } => {
            let removed = backend.delete(key).await?;
            Ok(format!("(integer) {}", u8::from(removed)))
        }
        Command::Stock(stock) => run_stock(stock, Ledger::new(backend)).await,
        Command::Lock(lock) => {
            let mut lock_config = config.lock.clone();
            lock_config.watchdog = false;
            run_lock(lock, DistributedLock::new(backend, &lock_config)).await
        }
        offline => run_offline(offline, config),
    }
}

async fn run_stock(command: &StockCommand, ledger: Ledger) -> Result<String> {
    let result = match command {
        StockCommand::Deduct {
            stock,
            reserved,
            amount,
        } => ledger.deduct(&StockPair::new(stock, reserved), *amount).await?,
        StockCommand::Restore {
            stock,
            reserved,
            amount,
        } => ledger.restore(&StockPair::new(stock, reserved), *amount).await?,
        StockCommand::DeductMany { pairs, amounts } => ledger.deduct_many(pairs, amounts).await?,
        StockCommand::RestoreMany { pairs, amounts } => ledger.restore_many(pairs, amounts).await?,
        StockCommand::Settle { reserved, amounts } => ledger.settle(reserved, amounts).await?,
    };
    Ok(outcome(result))
}

async fn run_lock(command: &LockCommand, lock: DistributedLock) -> Result<String> {
    match command {
        LockCommand::Probe { key } => match lock.try_acquire(key).await {
            Ok(token) => {
                let lease_id = token.lease_id().to_string();
                lock.release(token).await;
                Ok(format!("free (probe lease {})", lease_id))
            }
            Err(Error::Conflict(_)) => Ok(format!("held ({})", lock.lease_key(key))),
            Err(err) => Err(err.into()),
        },
        LockCommand::Release { key, lease_id } => {
            if lock.release_lease(key, lease_id).await? {
                Ok("released".to_string())
            } else {
                Ok("not held under this token".to_string())
            }
        }
    }
}
