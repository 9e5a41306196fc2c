//! Admission miss handlers
//!
//! When the bloom filter (or a hot sentinel) confirms that a value does not
//! exist, the read path hands the decision to a named [`MissHandler`].

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::key::CacheKey;

/// Handler that fails the read with [`Error::NotFound`]
pub const EXCEPTION_HANDLER: &str = "exception";

/// Handler that returns an empty result
pub const EMPTY_HANDLER: &str = "empty";

/// Declared shape of a read's result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultShape {
    /// One value or nothing
    #[default]
    Single,
    /// A list of values
    Collection,
}

/// Strategy deciding what a confirmed-absent read returns
pub trait MissHandler: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// `Ok(Some(value))` is decoded into the caller's type, `Ok(None)` is
    /// logical absence
    fn handle(&self, key: &CacheKey, shape: ResultShape) -> Result<Option<Value>>;
}

/// Raises not-found
#[derive(Debug, Default)]
pub struct ExceptionHandler;

impl MissHandler for ExceptionHandler {
    fn name(&self) -> &str {
        EXCEPTION_HANDLER
    }

    fn handle(&self, key: &CacheKey, _shape: ResultShape) -> Result<Option<Value>> {
        Err(Error::NotFound(key.to_string()))
    }
}

/// Returns `[]` for collections and absence otherwise
#[derive(Debug, Default)]
pub struct EmptyHandler;

impl MissHandler for EmptyHandler {
    fn name(&self) -> &str {
        EMPTY_HANDLER
    }

    fn handle(&self, _key: &CacheKey, shape: ResultShape) -> Result<Option<Value>> {
        Ok(match shape {
            ResultShape::Single => None,
            ResultShape::Collection => Some(Value::Array(Vec::new())),
        })
    }
}

/// Named miss handlers
pub struct MissHandlers {
    handlers: HashMap<String, Arc<dyn MissHandler>>,
    default: String,
}

impl MissHandlers {
    /// Registry with the built-in handlers, using `default` for unnamed requests
    pub fn new(default: impl Into<String>) -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            default: default.into(),
        };
        registry.register(Arc::new(ExceptionHandler));
        registry.register(Arc::new(EmptyHandler));
        registry
    }

    /// Add or replace a handler under its own name
    pub fn register(&mut self, handler: Arc<dyn MissHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Resolve `name`, then the default, then the exception handler
    pub fn resolve(&self, name: Option<&str>) -> Arc<dyn MissHandler> {
        name.and_then(|n| self.handlers.get(n))
            .or_else(|| self.handlers.get(&self.default))
            .cloned()
            .unwrap_or_else(|| Arc::new(ExceptionHandler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_handlers() {
        let key = CacheKey::raw("user:7");
        let err = ExceptionHandler.handle(&key, ResultShape::Single).unwrap_err();
        assert!(matches!(err, Error::NotFound(ref k) if k == "user:7"));

        assert_eq!(EmptyHandler.handle(&key, ResultShape::Single).unwrap(), None);
        assert_eq!(
            EmptyHandler.handle(&key, ResultShape::Collection).unwrap(),
            Some(Value::Array(vec![]))
        );
    }

    #[test]
    fn test_resolution_order() {
        let registry = MissHandlers::new(EMPTY_HANDLER);
        assert_eq!(registry.resolve(Some("exception")).name(), EXCEPTION_HANDLER);
        assert_eq!(registry.resolve(None).name(), EMPTY_HANDLER);
        assert_eq!(registry.resolve(Some("nope")).name(), EMPTY_HANDLER);

        let registry = MissHandlers::new("missing");
        assert_eq!(registry.resolve(Some("nope")).name(), EXCEPTION_HANDLER);
    }

    #[test]
    fn test_custom_handler() {
        struct Zero;
        impl MissHandler for Zero {
            fn name(&self) -> &str {
                "zero"
            }
            fn handle(&self, _: &CacheKey, _: ResultShape) -> Result<Option<Value>> {
                Ok(Some(Value::from(0)))
            }
        }

        let mut registry = MissHandlers::new(EXCEPTION_HANDLER);
        registry.register(Arc::new(Zero));
        let handled = registry
            .resolve(Some("zero"))
            .handle(&CacheKey::raw("k"), ResultShape::Single)
            .unwrap();
        assert_eq!(handled, Some(Value::from(0)));
    }
}
