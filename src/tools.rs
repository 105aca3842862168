use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_TOOL_LATENCY_MS, MISSING_LOCATION_ERROR, WEATHER_TOOL_NAME};
use crate::specs::openai::OpenAiTool;
use crate::types::RelayError;

/// External tool collaborator.
///
/// Implementations report expected failures (bad arguments, unknown tools) as
/// JSON `{"error": ...}` text in the `Ok` variant. `Err` is reserved for
/// failures the implementation could not turn into data; the dispatcher
/// converts those as well.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool schemas advertised to the provider.
    fn definitions(&self) -> Vec<OpenAiTool>;

    async fn execute(&self, name: &str, arguments: &str) -> Result<String, RelayError>;
}

pub fn error_json(message: impl Into<String>) -> String {
    serde_json::json!({ "error": message.into() }).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    fn symbol(self) -> &'static str {
        match self {
            Self::Celsius => "°C",
            Self::Fahrenheit => "°F",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WeatherParams {
    pub location: String,
    #[serde(default)]
    pub unit: Option<TemperatureUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeatherReport {
    pub location: String,
    pub temperature: i32,
    pub unit: String,
    pub condition: String,
    pub humidity: u32,
    pub wind_speed: u32,
}

struct CityWeather {
    celsius: i32,
    fahrenheit: i32,
    condition: &'static str,
    humidity: u32,
    wind_speed: u32,
}

const UNKNOWN_CITY: CityWeather = CityWeather {
    celsius: 18,
    fahrenheit: 64,
    condition: "未知",
    humidity: 50,
    wind_speed: 10,
};

fn city_weather(location: &str) -> &'static CityWeather {
    const BEIJING: CityWeather = CityWeather {
        celsius: 15,
        fahrenheit: 59,
        condition: "晴朗",
        humidity: 45,
        wind_speed: 12,
    };
    const SHANGHAI: CityWeather = CityWeather {
        celsius: 20,
        fahrenheit: 68,
        condition: "多云",
        humidity: 60,
        wind_speed: 8,
    };
    const SHENZHEN: CityWeather = CityWeather {
        celsius: 25,
        fahrenheit: 77,
        condition: "阴天",
        humidity: 70,
        wind_speed: 5,
    };
    match location {
        "北京" => &BEIJING,
        "上海" => &SHANGHAI,
        "深圳" => &SHENZHEN,
        _ => &UNKNOWN_CITY,
    }
}

/// Mock weather lookup backed by a fixed table.
#[derive(Debug, Clone)]
pub struct WeatherTools {
    latency: Duration,
}

impl Default for WeatherTools {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TOOL_LATENCY_MS))
    }
}

impl WeatherTools {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    pub async fn get_weather(&self, params: &WeatherParams) -> WeatherReport {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let unit = params.unit.unwrap_or_default();
        let city = city_weather(&params.location);
        WeatherReport {
            location: params.location.clone(),
            temperature: match unit {
                TemperatureUnit::Celsius => city.celsius,
                TemperatureUnit::Fahrenheit => city.fahrenheit,
            },
            unit: unit.symbol().to_string(),
            condition: city.condition.to_string(),
            humidity: city.humidity,
            wind_speed: city.wind_speed,
        }
    }

    async fn run_weather(&self, params: serde_json::Value) -> Result<String, RelayError> {
        let has_location = params
            .get("location")
            .and_then(|l| l.as_str())
            .is_some_and(|l| !l.is_empty());
        if !has_location {
            return Ok(error_json(MISSING_LOCATION_ERROR));
        }
        let params: WeatherParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Ok(error_json(format!("Invalid weather parameters: {}", e))),
        };
        let report = self.get_weather(&params).await;
        Ok(serde_json::to_string(&report)?)
    }
}

#[async_trait]
impl ToolExecutor for WeatherTools {
    fn definitions(&self) -> Vec<OpenAiTool> {
        vec![OpenAiTool::function(
            WEATHER_TOOL_NAME,
            "获取指定城市的天气信息",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "location": {
                        "type": "string",
                        "description": "城市名称，例如：北京、上海、深圳"
                    },
                    "unit": {
                        "type": "string",
                        "enum": ["celsius", "fahrenheit"],
                        "description": "温度单位，默认为摄氏度"
                    }
                },
                "required": ["location"]
            }),
        )]
    }

    async fn execute(&self, name: &str, arguments: &str) -> Result<String, RelayError> {
        let params = if arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str::<serde_json::Value>(arguments) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("[🔧] Failed to parse arguments for {}: {}", name, e);
                    return Ok(error_json(format!("Invalid JSON arguments: {}", e)));
                }
            }
        };

        match name {
            WEATHER_TOOL_NAME => self.run_weather(params).await,
            _ => Ok(error_json(format!("Unknown tool: {}", name))),
        }
    }
}
