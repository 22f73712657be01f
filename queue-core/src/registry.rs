use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// A user-supplied unit of work. Must be idempotent: at-least-once delivery
/// means the same payload can be handed to `call` more than once.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, payload: Value) -> Result<(), String>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), String>> + Send,
{
    async fn call(&self, payload: Value) -> Result<(), String> {
        (self)(payload).await
    }
}

/// Result of a payload validator: `valid` gates `enqueue`, `message`
/// explains a rejection to the caller and ends up in `InputError`.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, payload: &Value) -> ValidationResult;
}

impl<F> Validator for F
where
    F: Fn(&Value) -> ValidationResult + Send + Sync,
{
    fn validate(&self, payload: &Value) -> ValidationResult {
        (self)(payload)
    }
}

/// Where a `validate` call's verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSource {
    Validator,
    Auto,
    None,
}

#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub message: Option<String>,
    pub source: ValidationSource,
}

/// Policy overrides and optional validator bound to a handler name.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn Handler>,
    pub max_retries: Option<u32>,
    pub max_processing_time: Option<Duration>,
    pub validator: Option<Arc<dyn Validator>>,
    /// Keys `validate` checks for when no validator is configured and
    /// `source` falls back to `Auto`. Populated at registration time by a
    /// caller that wants best-effort shape checking without writing a full
    /// validator closure.
    pub expected_keys: Vec<String>,
}

impl HandlerEntry {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            max_retries: None,
            max_processing_time: None,
            validator: None,
            expected_keys: Vec::new(),
        }
    }
}

/// Options accepted by `register`, mirroring spec.md §4.2.
#[derive(Default)]
pub struct RegisterOptions {
    pub max_retries: Option<u32>,
    pub max_processing_time: Option<Duration>,
    pub validator: Option<Arc<dyn Validator>>,
    pub expected_keys: Vec<String>,
}

/// Process-local name -> handler map. Never consulted by non-owning
/// processes; registration is idempotent on name collision (last writer
/// wins) and safe to call before the first `enqueue`.
///
/// Backed by a plain `RwLock<HashMap<...>>`: write-rarely / read-often at a
/// scale where `arc-swap` buys nothing, the same concurrency model
/// `HealthRegistry`'s `Arc<RwLock<HashMap<...>>>` uses for its own shared
/// in-process map.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        options: RegisterOptions,
    ) {
        let entry = HandlerEntry {
            handler,
            max_retries: options.max_retries,
            max_processing_time: options.max_processing_time,
            validator: options.validator,
            expected_keys: options.expected_keys,
        };
        self.entries
            .write()
            .expect("poisoned HandlerRegistry lock")
            .insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<HandlerEntry> {
        self.entries
            .read()
            .expect("poisoned HandlerRegistry lock")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .expect("poisoned HandlerRegistry lock")
            .contains_key(name)
    }

    /// Validate a payload against a registered handler. `source` reports
    /// which mechanism produced the verdict: `Validator` when the handler
    /// has one configured, `Auto` when it instead has `expected_keys` and we
    /// fall back to a presence check, `None` when neither is configured.
    pub fn validate(&self, name: &str, payload: &Value) -> Validation {
        let Some(entry) = self.get(name) else {
            return Validation {
                valid: true,
                message: None,
                source: ValidationSource::None,
            };
        };

        if let Some(validator) = &entry.validator {
            let result = validator.validate(payload);
            return Validation {
                valid: result.valid,
                message: result.message,
                source: ValidationSource::Validator,
            };
        }

        if !entry.expected_keys.is_empty() {
            let missing: Vec<&str> = entry
                .expected_keys
                .iter()
                .filter(|key| payload.get(key.as_str()).is_none())
                .map(|s| s.as_str())
                .collect();
            return if missing.is_empty() {
                Validation {
                    valid: true,
                    message: None,
                    source: ValidationSource::Auto,
                }
            } else {
                Validation {
                    valid: false,
                    message: Some(format!("payload missing expected keys: {:?}", missing)),
                    source: ValidationSource::Auto,
                }
            };
        }

        Validation {
            valid: true,
            message: None,
            source: ValidationSource::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn call(&self, _payload: Value) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn register_is_last_writer_wins() {
        let registry = HandlerRegistry::new();
        registry.register("job", Arc::new(Noop), RegisterOptions::default());
        assert!(registry.contains("job"));

        registry.register(
            "job",
            Arc::new(Noop),
            RegisterOptions {
                max_retries: Some(7),
                ..Default::default()
            },
        );
        assert_eq!(registry.get("job").unwrap().max_retries, Some(7));
    }

    #[test]
    fn validate_none_when_unconfigured() {
        let registry = HandlerRegistry::new();
        registry.register("job", Arc::new(Noop), RegisterOptions::default());
        let result = registry.validate("job", &serde_json::json!({}));
        assert_eq!(result.source, ValidationSource::None);
        assert!(result.valid);
    }

    #[test]
    fn validate_auto_checks_expected_keys() {
        let registry = HandlerRegistry::new();
        registry.register(
            "job",
            Arc::new(Noop),
            RegisterOptions {
                expected_keys: vec!["email".to_string()],
                ..Default::default()
            },
        );

        let missing = registry.validate("job", &serde_json::json!({}));
        assert_eq!(missing.source, ValidationSource::Auto);
        assert!(!missing.valid);

        let present = registry.validate("job", &serde_json::json!({"email": "a@b.com"}));
        assert!(present.valid);
    }

    #[test]
    fn validate_prefers_validator_over_auto() {
        let registry = HandlerRegistry::new();
        registry.register(
            "job",
            Arc::new(Noop),
            RegisterOptions {
                expected_keys: vec!["email".to_string()],
                validator: Some(Arc::new(|_: &Value| ValidationResult::reject("nope"))),
                ..Default::default()
            },
        );

        let result = registry.validate("job", &serde_json::json!({"email": "a@b.com"}));
        assert_eq!(result.source, ValidationSource::Validator);
        assert!(!result.valid);
    }
}
