//! Per-call request descriptions
//!
//! These replace method interception: a call site builds a request with an
//! already resolved [`CacheKey`] and passes its callback explicitly.

use crate::bloom::BloomFilter;
use crate::handler::ResultShape;
use crate::key::CacheKey;

/// Value(s) tested against the bloom filter before touching the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BloomProbe {
    /// One value
    Single(String),
    /// Several values; admitted if any of them might be present
    Many(Vec<String>),
}

impl BloomProbe {
    /// Probe for one value
    pub fn single(value: impl Into<String>) -> Self {
        BloomProbe::Single(value.into())
    }

    /// Probe for a collection
    pub fn many<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BloomProbe::Many(values.into_iter().map(Into::into).collect())
    }

    /// Whether the filter lets the request through
    pub fn admitted_by(&self, filter: &BloomFilter) -> bool {
        match self {
            BloomProbe::Single(value) => filter.might_contain(value),
            BloomProbe::Many(values) => filter.might_contain_any(values),
        }
    }

    /// Record every probe value as present
    pub fn insert_into(&self, filter: &BloomFilter) {
        match self {
            BloomProbe::Single(value) => filter.put(value),
            BloomProbe::Many(values) => values.iter().for_each(|v| filter.put(v)),
        }
    }
}

/// A get-or-compute call
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// Cache key
    pub key: CacheKey,
    /// Optional admission probe
    pub bloom_probe: Option<BloomProbe>,
    /// Miss handler name; `None` uses the configured one
    pub miss_handler: Option<String>,
    /// Lock strategy name; `None` uses the configured one
    pub lock_strategy: Option<String>,
    /// Declared result shape
    pub shape: ResultShape,
}

impl ReadRequest {
    /// Read of a single value under `key`
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            bloom_probe: None,
            miss_handler: None,
            lock_strategy: None,
            shape: ResultShape::Single,
        }
    }

    /// Set the admission probe
    pub fn probe(mut self, probe: BloomProbe) -> Self {
        self.bloom_probe = Some(probe);
        self
    }

    /// Select a miss handler
    pub fn miss_handler(mut self, name: impl Into<String>) -> Self {
        self.miss_handler = Some(name.into());
        self
    }

    /// Select a lock strategy
    pub fn lock(mut self, name: impl Into<String>) -> Self {
        self.lock_strategy = Some(name.into());
        self
    }

    /// Declare a collection result
    pub fn collection(mut self) -> Self {
        self.shape = ResultShape::Collection;
        self
    }
}

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Creates the value; adds the probe to the bloom filter
    Insert,
    /// Changes an existing value
    Update,
    /// Removes the value
    Delete,
}

/// A mutate-then-invalidate call
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Cache key to invalidate
    pub key: CacheKey,
    /// Kind of mutation
    pub kind: WriteKind,
    /// Admission probe (checked for updates and deletes, recorded for inserts)
    pub bloom_probe: Option<BloomProbe>,
    /// Override of `repopulate_on_write`
    pub repopulate: Option<bool>,
}

impl WriteRequest {
    /// Write of `kind` under `key`
    pub fn new(key: CacheKey, kind: WriteKind) -> Self {
        Self {
            key,
            kind,
            bloom_probe: None,
            repopulate: None,
        }
    }

    /// Insert under `key`
    pub fn insert(key: CacheKey) -> Self {
        Self::new(key, WriteKind::Insert)
    }

    /// Update under `key`
    pub fn update(key: CacheKey) -> Self {
        Self::new(key, WriteKind::Update)
    }

    /// Delete under `key`
    pub fn delete(key: CacheKey) -> Self {
        Self::new(key, WriteKind::Delete)
    }

    /// Set the admission probe
    pub fn probe(mut self, probe: BloomProbe) -> Self {
        self.bloom_probe = Some(probe);
        self
    }

    /// Write the mutate result back instead of leaving the key empty
    pub fn repopulate(mut self, repopulate: bool) -> Self {
        self.repopulate = Some(repopulate);
        self
    }
}
