use std::fmt;

use crate::constants::{
    API_KEY_ENV, DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};
use crate::types::{RelayError, Result};

/// Provider settings injected into the relay at construction.
#[derive(Clone)]
pub struct RelayConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

// Keeps the key out of logs.
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl RelayConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Reads the API key from the environment; an empty value counts as unset.
    pub fn api_key_from_env() -> Option<String> {
        match std::env::var(API_KEY_ENV) {
            Ok(k) if !k.trim().is_empty() => Some(k),
            _ => None,
        }
    }

    pub fn api_key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(k) => Ok(k),
            None => Err(RelayError::Config(format!("{} not configured", API_KEY_ENV)).into()),
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_config_error() {
        let config = RelayConfig::default();
        let err = config.api_key().unwrap_err();
        match err.inner {
            RelayError::Config(msg) => assert_eq!(msg, "SILICONFLOW_API_KEY not configured"),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn completions_url_tolerates_trailing_slash() {
        let config = RelayConfig::new("k").with_base_url("http://localhost:9000/v1/");
        assert_eq!(config.completions_url(), "http://localhost:9000/v1/chat/completions");
    }

    #[test]
    fn debug_redacts_key() {
        let rendered = format!("{:?}", RelayConfig::new("sk-secret"));
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
