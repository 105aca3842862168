use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RelayConfig;
use crate::constants::{
    DEFAULT_BASE_URL, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
    DEFAULT_TOOL_LATENCY_MS,
};
use crate::dispatcher::ToolDispatcher;
use crate::streaming::Relay;
use crate::tools::ToolExecutor;
use crate::types::{ObservedError, RelayError, Result};
use crate::upstream::UpstreamClient;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "SILICONFLOW_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    #[arg(long, env = "SILICONFLOW_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,
    #[arg(long, default_value_t = DEFAULT_TOOL_LATENCY_MS)]
    pub tool_latency_ms: u64,
    /// Applies to connection setup only; streamed bodies are not cut off.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value = ".")]
    pub log_dir: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            tool_latency_ms: DEFAULT_TOOL_LATENCY_MS,
            connect_timeout_secs: 10,
            max_body_size: 2 * 1024 * 1024,
            log_dir: ".".to_string(),
        }
    }
}

impl Args {
    pub fn relay_config(&self, api_key: Option<String>) -> RelayConfig {
        RelayConfig {
            api_key,
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()
            .map_err(|e| ObservedError::from(RelayError::Network(e)))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub relay: Arc<Relay>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn new(
        args: Arc<Args>,
        config: RelayConfig,
        client: reqwest::Client,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let config = Arc::new(config);
        let upstream = UpstreamClient::new(client, config.clone());
        let relay = Relay::new(upstream, ToolDispatcher::new(executor));
        Self {
            config,
            relay: Arc::new(relay),
            args,
        }
    }
}
