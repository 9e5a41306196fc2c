//! Atomic scripts executed by the backend
//!
//! Every multi-step operation the cache and ledger need is expressed as a
//! named Lua script. Redis-compatible servers run the source through `EVAL`;
//! [`MemoryBackend`](crate::MemoryBackend) matches on the name and runs an
//! equivalent native routine under its store lock.

/// A named Lua script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    name: &'static str,
    source: &'static str,
}

impl Script {
    /// Create a script from a stable name and its Lua source
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    /// Stable identifier of the script
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua source sent to the server
    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Look up a built-in script by its Lua source
    pub fn from_source(source: &str) -> Option<Script> {
        BUILTIN.iter().copied().find(|s| s.source == source)
    }
}

/// Delete `KEYS[1]` only if it still holds `ARGV[1]`. Returns 1 when deleted.
pub const COMPARE_AND_DELETE: Script = Script::new(
    "compare_and_delete",
    r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
);

/// Re-arm the TTL of `KEYS[1]` to `ARGV[2]` milliseconds while it still holds
/// `ARGV[1]`. Returns 1 when renewed.
pub const RENEW_LEASE: Script = Script::new(
    "renew_lease",
    r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#,
);

/// Move `ARGV[1]` from stock `KEYS[1]` to reserved `KEYS[2]`.
/// Returns -1 for unlimited stock, 1 when applied, 0 when rejected.
pub const DEDUCT: Script = Script::new(
    "deduct",
    r#"
local stock = tonumber(redis.call('GET', KEYS[1])) or 0
if stock == -1 then
    return -1
end
local amount = tonumber(ARGV[1])
if amount == nil or amount <= 0 or stock < amount then
    return 0
end
redis.call('DECRBY', KEYS[1], amount)
redis.call('INCRBY', KEYS[2], amount)
return 1
"#,
);

/// Move `ARGV[1]` from reserved `KEYS[2]` back to stock `KEYS[1]`.
/// Returns -1 for unlimited stock, 1 when applied, 0 when rejected.
pub const RESTORE: Script = Script::new(
    "restore",
    r#"
local stock = tonumber(redis.call('GET', KEYS[1])) or 0
if stock == -1 then
    return -1
end
local reserved = tonumber(redis.call('GET', KEYS[2])) or 0
local amount = tonumber(ARGV[1])
if amount == nil or amount <= 0 or reserved < amount then
    return 0
end
redis.call('DECRBY', KEYS[2], amount)
redis.call('INCRBY', KEYS[1], amount)
return 1
"#,
);

/// Batch deduct over `(stock, reserved)` key pairs with one amount per pair.
/// Validates every pair before mutating any. Returns 1 when applied.
pub const DEDUCT_MANY: Script = Script::new(
    "deduct_many",
    r#"
for i = 1, #KEYS, 2 do
    local stock = tonumber(redis.call('GET', KEYS[i])) or 0
    local amount = tonumber(ARGV[math.floor((i + 1) / 2)]) or 0
    if stock ~= -1 and stock < amount then
        return 0
    end
end
for i = 1, #KEYS, 2 do
    local stock = tonumber(redis.call('GET', KEYS[i])) or 0
    local amount = tonumber(ARGV[math.floor((i + 1) / 2)]) or 0
    if stock ~= -1 and amount ~= 0 then
        redis.call('DECRBY', KEYS[i], amount)
        redis.call('INCRBY', KEYS[i + 1], amount)
    end
end
return 1
"#,
);

/// Batch restore over `(stock, reserved)` key pairs with one amount per pair.
/// Validates every pair before mutating any. Returns 1 when applied.
pub const RESTORE_MANY: Script = Script::new(
    "restore_many",
    r#"
for i = 1, #KEYS, 2 do
    local stock = tonumber(redis.call('GET', KEYS[i])) or 0
    local reserved = tonumber(redis.call('GET', KEYS[i + 1])) or 0
    local amount = tonumber(ARGV[math.floor((i + 1) / 2)]) or 0
    if stock ~= -1 and reserved < amount then
        return 0
    end
end
for i = 1, #KEYS, 2 do
    local stock = tonumber(redis.call('GET', KEYS[i])) or 0
    local amount = tonumber(ARGV[math.floor((i + 1) / 2)]) or 0
    if stock ~= -1 and amount ~= 0 then
        redis.call('DECRBY', KEYS[i + 1], amount)
        redis.call('INCRBY', KEYS[i], amount)
    end
end
return 1
"#,
);

/// Permanently consume `ARGV[i]` from each reserved counter `KEYS[i]`.
/// Validates every counter before mutating any. Returns 1 when applied.
pub const SETTLE: Script = Script::new(
    "settle",
    r#"
for i = 1, #KEYS do
    local reserved = tonumber(redis.call('GET', KEYS[i])) or 0
    local amount = tonumber(ARGV[i]) or 0
    if reserved < amount then
        return 0
    end
end
for i = 1, #KEYS do
    local amount = tonumber(ARGV[i]) or 0
    if amount ~= 0 then
        redis.call('DECRBY', KEYS[i], amount)
    end
end
return 1
"#,
);

const BUILTIN: [Script; 7] = [
    COMPARE_AND_DELETE,
    RENEW_LEASE,
    DEDUCT,
    RESTORE,
    DEDUCT_MANY,
    RESTORE_MANY,
    SETTLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = BUILTIN.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BUILTIN.len());
    }

    #[test]
    fn test_lookup_by_source() {
        assert_eq!(Script::from_source(DEDUCT.source()), Some(DEDUCT));
        assert_eq!(Script::from_source("return 1"), None);
    }
}
