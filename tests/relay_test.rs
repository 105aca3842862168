use chatrelay::config::RelayConfig;
use chatrelay::dispatcher::ToolDispatcher;
use chatrelay::specs::openai::{OpenAiMessage, OpenAiTool};
use chatrelay::streaming::{Relay, StreamState};
use chatrelay::tools::{ToolExecutor, WeatherReport, WeatherTools};
use chatrelay::upstream::UpstreamClient;
use chatrelay::*;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn relay_with(server: &MockServer, tools: Arc<dyn ToolExecutor>) -> Relay {
    let config = Arc::new(RelayConfig::new("test-key").with_base_url(server.uri()));
    let upstream = UpstreamClient::new(reqwest::Client::new(), config);
    Relay::new(upstream, ToolDispatcher::new(tools))
}

fn relay_for(server: &MockServer) -> Relay {
    relay_with(server, Arc::new(WeatherTools::new(Duration::ZERO)))
}

fn relay_for_broken(server: &MockServer) -> Relay {
    relay_with(server, Arc::new(BrokenWeather))
}

/// Advertises the weather tool but fails every call: 北京 with an error,
/// anything else with a panic.
struct BrokenWeather;

#[async_trait::async_trait]
impl ToolExecutor for BrokenWeather {
    fn definitions(&self) -> Vec<OpenAiTool> {
        WeatherTools::default().definitions()
    }

    async fn execute(&self, _name: &str, arguments: &str) -> std::result::Result<String, RelayError> {
        if arguments.contains("北京") {
            Err(RelayError::Tool("weather backend unreachable".to_string()))
        } else {
            panic!("weather backend crashed");
        }
    }
}

fn sse_body(chunks: &[Value], done: bool) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    if done {
        body.push_str("data: [DONE]\n\n");
    }
    body
}

fn content_chunk(text: &str) -> Value {
    json!({"id": "c1", "model": "m", "choices": [{"index": 0, "delta": {"content": text}}]})
}

fn tool_chunk(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> Value {
    let mut call = json!({"index": index, "function": {"arguments": args}});
    if let Some(id) = id {
        call["id"] = json!(id);
        call["type"] = json!("function");
    }
    if let Some(name) = name {
        call["function"]["name"] = json!(name);
    }
    json!({"choices": [{"index": 0, "delta": {"tool_calls": [call]}}]})
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

async fn run_turn(relay: &Relay, text: &str) -> (StreamState, Vec<RelayEvent>) {
    let (tx, mut rx) = mpsc::channel(100);
    let state = relay.run(vec![OpenAiMessage::user(text)], tx).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (state, events)
}

async fn mount_follow_up(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("tool_call_id"))
        .respond_with(sse_response(body))
        .with_priority(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_plain_text_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_string_contains("\"tool_choice\":\"auto\""))
        .respond_with(sse_response(sse_body(
            &[content_chunk("你好"), content_chunk(""), content_chunk("！")],
            true,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let (state, events) = run_turn(&relay_for(&server), "你好").await;

    assert_eq!(state, StreamState::Done);
    assert_eq!(
        events,
        vec![
            RelayEvent::Content("你好".to_string()),
            RelayEvent::Content("！".to_string()),
            RelayEvent::Done,
        ]
    );
}

#[tokio::test]
async fn test_single_tool_call_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[
                tool_chunk(0, Some("call_abc"), Some("get_weather"), ""),
                tool_chunk(0, None, None, "{\"loca"),
                tool_chunk(0, None, None, "tion\":\"北京\"}"),
            ],
            true,
        )))
        .expect(1)
        .mount(&server)
        .await;
    mount_follow_up(&server, sse_body(&[content_chunk("北京今天晴朗")], true)).await;

    let (state, events) = run_turn(&relay_for(&server), "北京天气怎么样").await;
    assert_eq!(state, StreamState::Done);
    assert_eq!(events.len(), 4, "events: {:?}", events);

    let expected_call = ToolCall::new("call_abc", "get_weather", r#"{"location":"北京"}"#);
    assert_eq!(events[0], RelayEvent::ToolCalls(vec![expected_call]));

    let RelayEvent::ToolResults(results) = &events[1] else {
        panic!("Expected tool results, got {:?}", events[1]);
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tool_call_id, "call_abc");
    let report: WeatherReport = serde_json::from_str(&results[0].content).unwrap();
    assert_eq!(report.temperature, 15);
    assert_eq!(report.condition, "晴朗");
    assert_eq!(report.unit, "°C");

    assert_eq!(events[2], RelayEvent::Content("北京今天晴朗".to_string()));
    assert_eq!(events[3], RelayEvent::Done);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let follow_up: Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert!(follow_up.get("tools").is_none());
    assert!(follow_up.get("tool_choice").is_none());
    assert_eq!(follow_up["stream"], true);
    let messages = follow_up["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["tool_calls"][0]["id"], "call_abc");
    assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"], r#"{"location":"北京"}"#);
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_call_id"], "call_abc");
}

#[tokio::test]
async fn test_parallel_calls_with_duplicate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[
                tool_chunk(0, Some("call_1"), Some("get_weather"), "{\"location\":\"北京\"}"),
                tool_chunk(1, Some("call_2"), Some("get_weather"), "{\"location\":"),
                tool_chunk(2, Some("call_3"), Some("get_weather"), "{\"location\":\"北京\"}"),
                tool_chunk(1, None, None, "\"上海\"}"),
            ],
            true,
        )))
        .mount(&server)
        .await;
    mount_follow_up(&server, sse_body(&[content_chunk("两地天气如上")], true)).await;

    let (state, events) = run_turn(&relay_for(&server), "北京和上海天气").await;
    assert_eq!(state, StreamState::Done);

    let RelayEvent::ToolCalls(calls) = &events[0] else {
        panic!("Expected tool calls, got {:?}", events[0]);
    };
    let ids: Vec<_> = calls.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);
    assert_eq!(calls[1].function.arguments, r#"{"location":"上海"}"#);

    let RelayEvent::ToolResults(results) = &events[1] else {
        panic!("Expected tool results, got {:?}", events[1]);
    };
    let result_ids: Vec<_> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
    assert_eq!(result_ids, vec!["call_1", "call_2", "call_3"]);
    assert!(results[1].content.contains("多云"));
    let dup: Value = serde_json::from_str(&results[2].content).unwrap();
    assert_eq!(dup, json!({"error": "duplicate call, reuse prior result"}));

    assert_eq!(events.last(), Some(&RelayEvent::Done));
}

#[tokio::test]
async fn test_upstream_rejection_emits_single_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let (state, events) = run_turn(&relay_for(&server), "你好").await;

    assert_eq!(state, StreamState::Error);
    assert_eq!(
        events,
        vec![RelayEvent::Error("API Error (401): invalid api key".to_string())]
    );
}

#[tokio::test]
async fn test_follow_up_failure_reports_error_then_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[tool_chunk(0, Some("call_1"), Some("get_weather"), "{\"location\":\"深圳\"}")],
            true,
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("tool_call_id"))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .with_priority(1)
        .mount(&server)
        .await;

    let (_, events) = run_turn(&relay_for(&server), "深圳天气").await;

    assert_eq!(events.len(), 4, "events: {:?}", events);
    assert!(matches!(events[0], RelayEvent::ToolCalls(_)));
    assert!(matches!(events[1], RelayEvent::ToolResults(_)));
    assert_eq!(events[2], RelayEvent::Error("API Error (500): overloaded".to_string()));
    assert_eq!(events[3], RelayEvent::Done);
}

#[tokio::test]
async fn test_malformed_lines_produce_no_events() {
    let server = MockServer::start().await;
    let body = format!(
        ": comment\n\nevent: ping\n\ndata: {{not json\n\ndata: {}\n\ndata: {{\"choices\":[]}}\n\n{}",
        content_chunk("ok"),
        "data: [DONE]\n\n"
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body))
        .mount(&server)
        .await;

    let (state, events) = run_turn(&relay_for(&server), "hi").await;

    assert_eq!(state, StreamState::Done);
    assert_eq!(
        events,
        vec![RelayEvent::Content("ok".to_string()), RelayEvent::Done]
    );
}

#[tokio::test]
async fn test_stream_without_done_marker_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(&[content_chunk("partial")], false)))
        .mount(&server)
        .await;

    let (state, events) = run_turn(&relay_for(&server), "hi").await;

    assert_eq!(state, StreamState::Done);
    assert_eq!(
        events,
        vec![RelayEvent::Content("partial".to_string()), RelayEvent::Done]
    );
}

#[tokio::test]
async fn test_cut_off_tool_stream_is_not_dispatched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[
                content_chunk("查询中"),
                tool_chunk(0, Some("call_1"), Some("get_weather"), "{\"locat"),
            ],
            false,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let (state, events) = run_turn(&relay_for(&server), "北京天气").await;

    assert_eq!(state, StreamState::Error);
    assert_eq!(
        events,
        vec![
            RelayEvent::Content("查询中".to_string()),
            RelayEvent::Error("Upstream stream ended before [DONE]".to_string()),
        ]
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, RelayEvent::ToolCalls(_) | RelayEvent::ToolResults(_))));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failing_tools_still_reach_follow_up() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[
                tool_chunk(0, Some("call_1"), Some("get_weather"), "{\"location\":\"北京\"}"),
                tool_chunk(1, Some("call_2"), Some("get_weather"), "{\"location\":\"上海\"}"),
            ],
            true,
        )))
        .mount(&server)
        .await;
    mount_follow_up(&server, sse_body(&[content_chunk("暂时无法获取天气")], true)).await;

    let (state, events) = run_turn(&relay_for_broken(&server), "北京和上海天气").await;
    assert_eq!(state, StreamState::Done);

    let RelayEvent::ToolResults(results) = &events[1] else {
        panic!("Expected tool results, got {:?}", events[1]);
    };
    assert_eq!(results.len(), 2);
    let failed: Value = serde_json::from_str(&results[0].content).unwrap();
    assert!(failed["error"].as_str().unwrap().contains("weather backend unreachable"));
    let panicked: Value = serde_json::from_str(&results[1].content).unwrap();
    assert!(panicked["error"].as_str().unwrap().contains("weather backend crashed"));
    assert_eq!(events[2], RelayEvent::Content("暂时无法获取天气".to_string()));
    assert_eq!(events[3], RelayEvent::Done);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let follow_up: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = follow_up["messages"].as_array().unwrap();
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["tool_call_id"], "call_1");
    assert_eq!(messages[2]["content"], results[0].content.as_str());
    assert_eq!(messages[3]["content"], results[1].content.as_str());
}

#[tokio::test]
async fn test_tool_deltas_in_follow_up_are_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(sse_body(
            &[tool_chunk(0, Some("call_1"), Some("get_weather"), "{\"location\":\"北京\"}")],
            true,
        )))
        .mount(&server)
        .await;
    mount_follow_up(
        &server,
        sse_body(
            &[
                tool_chunk(0, Some("call_9"), Some("get_weather"), "{}"),
                content_chunk("完成"),
            ],
            true,
        ),
    )
    .await;

    let (_, events) = run_turn(&relay_for(&server), "北京").await;

    let tool_call_events = events
        .iter()
        .filter(|e| matches!(e, RelayEvent::ToolCalls(_)))
        .count();
    assert_eq!(tool_call_events, 1);
    assert_eq!(events[2], RelayEvent::Content("完成".to_string()));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_client_disconnect_stops_relay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            sse_response(sse_body(&[content_chunk("late")], true))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let relay = relay_for(&server);
    let (tx, rx) = mpsc::channel(100);
    drop(rx);
    let state = relay.run(vec![OpenAiMessage::user("hi")], tx).await;

    assert_eq!(state, StreamState::Error);
}
