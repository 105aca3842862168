use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

use crate::types::ProviderPulse;

pub const SESSION_ID_HEADER: &str = "x-relay-session-id";

/// Installs the global subscriber: stdout, a daily-rolling file and the
/// span-trace error layer. The returned guard must outlive the process.
pub fn init_tracing(log_dir: &str) -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "chatrelay=debug,tower_http=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "chatrelay.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

pub async fn session_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let session_id = Uuid::new_v4().to_string();
    if let Ok(val) = session_id.parse() {
        req.headers_mut().insert(SESSION_ID_HEADER, val);
    }

    let span = info_span!("request", session_id = %session_id);
    next.run(req).instrument(span).await
}

/// Per-stream counters, logged once the stream ends.
#[derive(Default)]
pub struct StreamMetric {
    pub phase: &'static str,
    pub lines: usize,
    pub chunks: usize,
    pub malformed: usize,
    pub tool_parts: usize,
    pub text_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    pub fn record_chunk(&mut self, pulse: &ProviderPulse) {
        self.chunks += 1;
        for choice in &pulse.choices {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.chars().count();
            }
            if let Some(tools) = &choice.delta.tool_calls {
                self.tool_parts += tools.len();
                for t in tools {
                    if let Some(name) = t.function.as_ref().and_then(|f| f.name.as_ref()) {
                        if !name.is_empty() {
                            self.tool_names.push(name.clone());
                        }
                    }
                }
            }
        }
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn log_summary(&self) {
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };

        info!(
            "[STREAM {} END] Lines: {} | Chunks: {} | Malformed: {} | Tools: {} | Text: {} chars",
            self.phase,
            self.lines,
            self.chunks,
            self.malformed,
            tools_str,
            self.text_chars
        );
    }
}
