//! Template engine: `{{KEY}}` expansion against an ordered provider chain
//!
//! Providers are consulted in registration order and the first hit wins.
//! Provider output is itself resolved before substitution, so values can
//! nest placeholders; a per-call resolution stack bounds the recursion and
//! doubles as the cycle detector.

pub mod providers;

use crate::error::{Result, VcpError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const KEY_PATTERN: &str = r"\{\{([A-Za-z0-9_:]+)\}\}";

/// A named resolver for a class of placeholder keys.
///
/// Returning `Ok(None)` means "not mine"; the engine moves on to the next
/// provider. Errors are logged and treated the same way.
#[async_trait]
pub trait ValueProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn value(&self, key: &str) -> Result<Option<String>>;
}

/// Guard-rail configuration for a [`TemplateEngine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fail the whole resolve call when a key recurs on the stack
    pub cycle_detection: bool,
    /// Maximum nesting depth of provider values
    pub max_depth: usize,
    /// Maximum unique placeholders in a single text
    pub max_placeholders: usize,
    /// Bound on the compiled-substitution cache; flushed wholesale on overflow
    pub regex_cache_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_detection: true,
            max_depth: 10,
            max_placeholders: 100,
            regex_cache_cap: 200,
        }
    }
}

/// Recursive placeholder resolver over an ordered provider chain.
pub struct TemplateEngine {
    providers: Vec<Arc<dyn ValueProvider>>,
    config: EngineConfig,
    key_re: Regex,
    substitution_cache: Mutex<HashMap<String, Regex>>,
}

impl TemplateEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            providers: Vec::new(),
            config,
            key_re: Regex::new(KEY_PATTERN).expect("static key pattern"),
            substitution_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register a provider. Registration order is resolution priority.
    pub fn register_provider(&mut self, provider: Arc<dyn ValueProvider>) {
        tracing::debug!(provider = provider.name(), "registering template provider");
        self.providers.push(provider);
    }

    /// Expand every resolvable `{{KEY}}` in `text`.
    ///
    /// Unresolved placeholders are left intact for downstream consumers.
    /// Cycle, depth and fan-out breaches fail the whole call.
    pub async fn resolve(&self, text: &str) -> Result<String> {
        let mut stack: Vec<String> = Vec::new();
        self.resolve_with_stack(text.to_string(), &mut stack).await
    }

    fn resolve_with_stack<'a>(
        &'a self,
        text: String,
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let keys = self.extract_keys(&text);
            if keys.is_empty() {
                return Ok(text);
            }
            if keys.len() > self.config.max_placeholders {
                return Err(VcpError::variable_resolve(format!(
                    "{} unique placeholders exceed the fan-out cap of {}",
                    keys.len(),
                    self.config.max_placeholders
                )));
            }

            let mut substitutions: Vec<(String, String)> = Vec::new();
            for key in keys {
                if self.config.cycle_detection && stack.iter().any(|k| k == &key) {
                    return Err(VcpError::circular_dependency(format!(
                        "circular reference while resolving {{{{{key}}}}} (stack: {})",
                        stack.join(" -> ")
                    )));
                }

                let Some(raw) = self.lookup(&key).await else {
                    continue;
                };

                if stack.len() >= self.config.max_depth {
                    return Err(VcpError::max_recursion_depth(format!(
                        "recursion depth {} exceeded at {{{{{key}}}}}",
                        self.config.max_depth
                    )));
                }
                stack.push(key.clone());
                let expanded = self.resolve_with_stack(raw, stack).await;
                stack.pop();
                substitutions.push((key, expanded?));
            }

            Ok(self.apply_substitutions(&text, &substitutions))
        })
    }

    /// Unique keys in order of first appearance.
    fn extract_keys(&self, text: &str) -> Vec<String> {
        let mut keys = Vec::new();
        for caps in self.key_re.captures_iter(text) {
            let key = &caps[1];
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        keys
    }

    async fn lookup(&self, key: &str) -> Option<String> {
        for provider in &self.providers {
            match provider.value(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        provider = provider.name(),
                        key,
                        error = %e,
                        "provider failed, trying next"
                    );
                }
            }
        }
        None
    }

    /// Batched replacement through the bounded compiled-regex cache.
    fn apply_substitutions(&self, text: &str, substitutions: &[(String, String)]) -> String {
        let mut cache = self.substitution_cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut result = text.to_string();
        for (key, value) in substitutions {
            let placeholder = format!("{{{{{key}}}}}");
            if !cache.contains_key(&placeholder) {
                if cache.len() >= self.config.regex_cache_cap {
                    tracing::debug!(cap = self.config.regex_cache_cap, "flushing substitution cache");
                    cache.clear();
                }
                // Escaped literals always compile
                let re = Regex::new(&regex::escape(&placeholder)).expect("escaped placeholder");
                cache.insert(placeholder.clone(), re);
            }
            let re = &cache[&placeholder];
            result = re
                .replace_all(&result, regex::NoExpand(value.as_str()))
                .into_owned();
        }
        result
    }
}
