/// Terminal sentinel of both the provider stream and the relay stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Provider defaults (SiliconFlow, OpenAI-compatible)
pub const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const API_KEY_ENV: &str = "SILICONFLOW_API_KEY";

/// Longest SSE line accepted from either side of the relay.
pub const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Upper bound on upstream lines read per stream.
pub const MAX_STREAM_LINES: usize = 100_000;

pub const DUPLICATE_CALL_ERROR: &str = "duplicate call, reuse prior result";

pub const MISSING_LOCATION_ERROR: &str = "缺少必需参数: location（城市名称）";

pub const WEATHER_TOOL_NAME: &str = "get_weather";
pub const DEFAULT_TOOL_LATENCY_MS: u64 = 500;
