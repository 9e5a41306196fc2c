//! Atomic stock ledger
//!
//! A stock counter is paired with a reserved counter. Deducting moves units
//! from stock into reserved, restoring moves them back, settling consumes
//! reserved units for good. A stock value of [`UNLIMITED`] short-circuits all
//! balance checks. Each call is one script, so no caller ever observes a
//! partially applied batch.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, Reply};
use crate::error::{Result, StoreError};
use crate::script::{Script, DEDUCT, DEDUCT_MANY, RESTORE, RESTORE_MANY, SETTLE};

/// Stock value meaning "never runs out"
pub const UNLIMITED: i64 = -1;

/// A stock counter and its companion reserved counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockPair {
    /// Key of the available-stock counter
    pub stock: String,
    /// Key of the reserved-stock counter
    pub reserved: String,
}

impl StockPair {
    /// Pair two counter keys
    pub fn new(stock: impl Into<String>, reserved: impl Into<String>) -> Self {
        Self {
            stock: stock.into(),
            reserved: reserved.into(),
        }
    }
}

/// Result of a ledger call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// Counters were updated
    Applied,
    /// Stock is unlimited; nothing was changed
    Unlimited,
    /// Balance check failed; nothing was changed
    Rejected,
}

impl LedgerOutcome {
    /// Whether the caller may proceed
    pub fn is_success(self) -> bool {
        !matches!(self, LedgerOutcome::Rejected)
    }

    fn from_reply(script: &Script, reply: &Reply) -> Result<Self> {
        match reply.as_integer() {
            Some(1) => Ok(LedgerOutcome::Applied),
            Some(-1) => Ok(LedgerOutcome::Unlimited),
            Some(0) => Ok(LedgerOutcome::Rejected),
            _ => Err(StoreError::Protocol(format!(
                "unexpected reply from '{}': {:?}",
                script.name(),
                reply
            ))),
        }
    }
}

/// Stock transfer operations over a [`Backend`]
#[derive(Clone)]
pub struct Ledger {
    backend: Arc<dyn Backend>,
}

impl Ledger {
    /// Create a ledger on top of a backend
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Reserve `amount` units: stock -= amount, reserved += amount
    pub async fn deduct(&self, pair: &StockPair, amount: i64) -> Result<LedgerOutcome> {
        self.run_pair(&DEDUCT, pair, amount).await
    }

    /// Give back `amount` reserved units: reserved -= amount, stock += amount
    pub async fn restore(&self, pair: &StockPair, amount: i64) -> Result<LedgerOutcome> {
        self.run_pair(&RESTORE, pair, amount).await
    }

    /// Deduct across many pairs; either every pair is updated or none is
    pub async fn deduct_many(&self, pairs: &[StockPair], amounts: &[i64]) -> Result<LedgerOutcome> {
        self.run_batch(&DEDUCT_MANY, pairs, amounts).await
    }

    /// Restore across many pairs; either every pair is updated or none is
    pub async fn restore_many(&self, pairs: &[StockPair], amounts: &[i64]) -> Result<LedgerOutcome> {
        self.run_batch(&RESTORE_MANY, pairs, amounts).await
    }

    /// Permanently consume reserved units after a successful order
    pub async fn settle(&self, reserved: &[String], amounts: &[i64]) -> Result<LedgerOutcome> {
        validate_amounts(reserved.len(), amounts)?;
        let args: Vec<String> = amounts.iter().map(i64::to_string).collect();
        let reply = self.backend.eval(&SETTLE, reserved, &args).await?;
        let outcome = LedgerOutcome::from_reply(&SETTLE, &reply)?;
        debug!("settle over {} counters: {:?}", reserved.len(), outcome);
        Ok(outcome)
    }

    async fn run_pair(&self, script: &Script, pair: &StockPair, amount: i64) -> Result<LedgerOutcome> {
        let keys = [pair.stock.clone(), pair.reserved.clone()];
        let reply = self
            .backend
            .eval(script, &keys, &[amount.to_string()])
            .await?;
        let outcome = LedgerOutcome::from_reply(script, &reply)?;
        debug!("{} {} x{}: {:?}", script.name(), pair.stock, amount, outcome);
        Ok(outcome)
    }

    async fn run_batch(&self, script: &Script, pairs: &[StockPair], amounts: &[i64]) -> Result<LedgerOutcome> {
        validate_amounts(pairs.len(), amounts)?;
        let keys: Vec<String> = pairs
            .iter()
            .flat_map(|p| [p.stock.clone(), p.reserved.clone()])
            .collect();
        let args: Vec<String> = amounts.iter().map(i64::to_string).collect();
        let reply = self.backend.eval(script, &keys, &args).await?;
        let outcome = LedgerOutcome::from_reply(script, &reply)?;
        debug!("{} over {} pairs: {:?}", script.name(), pairs.len(), outcome);
        Ok(outcome)
    }
}

fn validate_amounts(targets: usize, amounts: &[i64]) -> Result<()> {
    if targets == 0 {
        return Err(StoreError::InvalidArgument("no counters given".into()));
    }
    if targets != amounts.len() {
        return Err(StoreError::InvalidArgument(format!(
            "{} counters but {} amounts",
            targets,
            amounts.len()
        )));
    }
    if let Some(bad) = amounts.iter().find(|a| **a < 0) {
        return Err(StoreError::InvalidArgument(format!(
            "amount must not be negative: {}",
            bad
        )));
    }
    Ok(())
}
