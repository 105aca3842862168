#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use chatrelay::config::RelayConfig;
use chatrelay::constants::API_KEY_ENV;
use chatrelay::logging::{init_tracing, setup_panic_hook};
use chatrelay::server::router;
use chatrelay::tools::WeatherTools;
use chatrelay::{AppState, Args};

use clap::Parser;
use futures_util::FutureExt;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Arc::new(Args::parse());
    let _guard = init_tracing(&args.log_dir);
    setup_panic_hook();

    let config = args.relay_config(RelayConfig::api_key_from_env());
    if config.api_key().is_err() {
        tracing::warn!(
            "{} is not set; /api/chat will answer with a config error",
            API_KEY_ENV
        );
    }
    tracing::info!("Relay config: {:?}", config);

    let client = match args.http_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e.inner);
            std::process::exit(1);
        }
    };

    let tools = Arc::new(WeatherTools::new(Duration::from_millis(args.tool_latency_ms)));
    let state = Arc::new(AppState::new(args.clone(), config, client, tools));
    let app = router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("chatrelay listening on {}", addr);

    let server_future = async move { axum::serve(listener, app).await };
    match std::panic::AssertUnwindSafe(server_future)
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Server error: {}", e),
        Err(panic_payload) => {
            let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "Unknown panic"
            };
            tracing::error!(target: "panic", "CRITICAL: Server task panicked: {}", message);
        }
    }
}
