//! Provider adapters: launching external actor CLIs.
//!
//! One adapter per provider. Adapters capture every actor failure in the
//! returned [`InvocationResult`] -- callers branch on data, not on
//! exceptions -- and classify known failure shapes (credit exhaustion,
//! rate limits) separately via [`Provider::classify_result`].

pub mod claude;
pub mod home;
pub mod template;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use types::{ActivityEvent, FailureClass, InvocationResult, InvokeOptions, TokenUsage};

/// A provider adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name used in config and incident records.
    fn name(&self) -> &str;

    /// Run one actor invocation. Never returns an error: all failures
    /// surface in the result value.
    async fn invoke(&self, prompt: &str, opts: InvokeOptions<'_>) -> InvocationResult;

    /// Whether the provider CLI is installed and responsive.
    async fn is_available(&self) -> bool;

    /// Map a failed result onto a known failure class. `None` for
    /// successes and unrecognised failures.
    fn classify_result(&self, result: &InvocationResult) -> Option<FailureClass>;

    /// Models this provider can serve.
    fn list_models(&self) -> Vec<String>;

    /// The canonical invocation template, for operator overrides.
    fn default_invocation_template(&self) -> String;
}

/// Registry of provider adapters, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: impl Provider + 'static) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

// -----------------------------------------------------------------------
// Environment sanitization
// -----------------------------------------------------------------------

/// Variable-name fragments treated as secrets unless whitelisted.
const SECRET_MARKERS: &[&str] = &["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

/// Secret-shaped variables the actor CLIs legitimately need.
const SECRET_WHITELIST: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "OPENAI_API_KEY",
    "SSH_AUTH_SOCK",
];

/// Build a sanitized environment for a child invocation.
///
/// Starts from the process environment, drops secret-shaped variables
/// that are not whitelisted, then layers in the provider-specific
/// overrides (active model, isolated HOME, and so on).
pub fn sanitized_env(overrides: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(name, _)| {
            let upper = name.to_uppercase();
            let secret_shaped = SECRET_MARKERS.iter().any(|m| upper.contains(m));
            !secret_shaped || SECRET_WHITELIST.contains(&upper.as_str())
        })
        .collect();

    for (name, value) in overrides {
        env.retain(|(existing, _)| existing != name);
        env.push((name.clone(), value.clone()));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitized_env_drops_secret_shaped_vars() {
        // Safe: tests in this module share the env lock implicitly via
        // unique variable names.
        unsafe {
            std::env::set_var("STEROIDS_TEST_DB_PASSWORD", "hunter2");
            std::env::set_var("STEROIDS_TEST_PLAIN", "ok");
        }

        let env = sanitized_env(&[]);
        assert!(!env.iter().any(|(n, _)| n == "STEROIDS_TEST_DB_PASSWORD"));
        assert!(env.iter().any(|(n, _)| n == "STEROIDS_TEST_PLAIN"));

        unsafe {
            std::env::remove_var("STEROIDS_TEST_DB_PASSWORD");
            std::env::remove_var("STEROIDS_TEST_PLAIN");
        }
    }

    #[test]
    fn sanitized_env_keeps_whitelisted_secrets() {
        unsafe {
            std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        }
        let env = sanitized_env(&[]);
        assert!(env.iter().any(|(n, _)| n == "ANTHROPIC_API_KEY"));
        unsafe {
            std::env::remove_var("ANTHROPIC_API_KEY");
        }
    }

    #[test]
    fn overrides_replace_existing() {
        unsafe {
            std::env::set_var("STEROIDS_TEST_HOME_VAR", "/real/home");
        }
        let env = sanitized_env(&[("STEROIDS_TEST_HOME_VAR".to_string(), "/iso".to_string())]);
        let values: Vec<&str> = env
            .iter()
            .filter(|(n, _)| n == "STEROIDS_TEST_HOME_VAR")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(values, vec!["/iso"]);
        unsafe {
            std::env::remove_var("STEROIDS_TEST_HOME_VAR");
        }
    }

    #[test]
    fn registry_register_and_list() {
        let mut registry = ProviderRegistry::new();
        registry.register(claude::ClaudeProvider::new());
        assert!(registry.get("claude").is_some());
        assert_eq!(registry.list(), vec!["claude".to_string()]);
        assert!(registry.get("nope").is_none());
    }
}
