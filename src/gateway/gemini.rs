//! Gemini API gateway
//!
//! Speaks the `generateContent` / `streamGenerateContent` function-calling
//! protocol. Uses a long-lived reqwest::Client for connection pooling.

use super::{emit, ModelGateway};
use crate::config::OrchestratorConfig;
use crate::error::OrchestrationError;
use crate::models::{
    JsonMap, ModelRequest, ModelResponse, Part as TurnPart, RequestedCall, Role, StreamEvent,
    ToolDescriptor, Turn,
};
use crate::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const REFUSAL_MESSAGE: &str =
    "I'm sorry, but I can't help with that request.";

const BLOCKING_FINISH_REASONS: &[&str] = &["SAFETY", "RECITATION", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// Reusable Gemini gateway (connection-pooled)
pub struct GeminiGateway {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiGateway {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key: config.gemini_api_key.clone(),
            model: config.gemini_model.clone(),
            base_url: config.gemini_base_url.clone(),
        })
    }

    fn endpoint(&self, method: &str, extra_query: &str) -> String {
        format!(
            "{}/{}:{}?{}key={}",
            self.base_url, self.model, method, extra_query, self.api_key
        )
    }

    async fn post(&self, url: &str, body: &GeminiRequest) -> Result<reqwest::Response> {
        if self.api_key.is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                OrchestrationError::NetworkFailure(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let error_text = response.text().await.unwrap_or_default();
        error!(status = %status, "Gemini API error response: {}", error_text);
        Err(classify_status(status, &headers, error_text))
    }
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    async fn send(&self, request: ModelRequest) -> Result<ModelResponse> {
        let body = build_request(&request);
        let url = self.endpoint("generateContent", "");

        info!(model = %self.model, history = request.history.len(), "Calling Gemini API");

        let response = self.post(&url, &body).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OrchestrationError::NetworkFailure(format!("Gemini body read failed: {}", e)))?;

        let parsed: GeminiResponse = serde_json::from_slice(&bytes).map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            OrchestrationError::SchemaViolation(format!("Gemini parse error: {}", e))
        })?;

        let mut collector = ResponseCollector::default();
        collector.absorb(&parsed);
        collector.finish()
    }

    async fn send_streaming(
        &self,
        request: ModelRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ModelResponse> {
        let body = build_request(&request);
        let url = self.endpoint("streamGenerateContent", "alt=sse&");

        info!(model = %self.model, history = request.history.len(), "Streaming from Gemini API");

        let response = self.post(&url, &body).await?;
        relay_stream(sse_payloads(response.bytes_stream()), &events).await
    }
}

/// `data:` payloads of a server-sent-event byte stream
fn sse_payloads<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]> + From<&'static [u8]>,
    E: std::fmt::Display,
{
    // A final event without its blank line would otherwise be discarded at EOF
    let blank_line: &'static [u8] = b"\n\n";
    let terminator = stream::once(async move { Ok(B::from(blank_line)) });

    bytes.chain(terminator).eventsource().filter_map(|event| async move {
        match event {
            Ok(event) if event.data.trim().is_empty() => None,
            Ok(event) => Some(Ok(event.data)),
            Err(e) => Some(Err(OrchestrationError::NetworkFailure(format!(
                "Gemini stream broke: {}",
                e
            )))),
        }
    })
}

/// Feed streamed chunks through a collector, forwarding text as it arrives
async fn relay_stream<S>(payloads: S, events: &mpsc::Sender<StreamEvent>) -> Result<ModelResponse>
where
    S: Stream<Item = Result<String>>,
{
    futures::pin_mut!(payloads);
    let mut collector = ResponseCollector::default();

    while let Some(data) = payloads.next().await {
        let parsed: GeminiResponse = serde_json::from_str(&data?).map_err(|e| {
            OrchestrationError::SchemaViolation(format!("Gemini stream parse error: {}", e))
        })?;
        for text in collector.absorb(&parsed) {
            emit(events, StreamEvent::TextDelta { chunk: text }).await;
        }
    }

    let final_response = collector.finish()?;
    emit(events, StreamEvent::Completed(final_response.clone())).await;
    Ok(final_response)
}

/// Map an unsuccessful HTTP status onto the gateway error taxonomy
fn classify_status(status: StatusCode, headers: &HeaderMap, body: String) -> OrchestrationError {
    match status.as_u16() {
        429 => OrchestrationError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        408 | 500..=599 => {
            OrchestrationError::NetworkFailure(format!("Gemini returned {}: {}", status, body))
        }
        _ => OrchestrationError::InvalidRequest(format!("Gemini returned {}: {}", status, body)),
    }
}

/// `Retry-After` in whole seconds, capped at one minute
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    (secs > 0 && secs <= 60).then(|| Duration::from_secs(secs))
}

/// Build system prompt for the assistant
fn build_system_prompt(tools: &[ToolDescriptor]) -> String {
    let base_prompt = r#"You are a helpful personal finance assistant embedded in a budgeting dashboard.

Guidelines:
- Use the available tools to look up the user's real figures instead of guessing
- Be structured and concise
- Quote amounts exactly as the tools report them
- If a tool returns an error, explain it briefly and suggest what the user can do"#;

    if tools.is_empty() {
        base_prompt.to_string()
    } else {
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        format!("{}\n\nAvailable tools: {}", base_prompt, names.join(", "))
    }
}

fn build_request(request: &ModelRequest) -> GeminiRequest {
    let mut contents: Vec<Content> = Vec::new();

    for turn in &request.history {
        push_parts(&mut contents, content_role(turn), &turn.parts);
    }

    for part in &request.new_input {
        let role = match part {
            TurnPart::ToolResult(_) => "function",
            _ => "user",
        };
        push_parts(&mut contents, role, std::slice::from_ref(part));
    }

    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolSet {
            function_declarations: request
                .tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }]
    };

    GeminiRequest {
        contents,
        tools,
        generation_config: GenerationConfig {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 1024,
        },
        system_instruction: SystemInstruction {
            parts: vec![Part::text(build_system_prompt(&request.tools))],
        },
    }
}

fn content_role(turn: &Turn) -> &'static str {
    match turn.role {
        Role::User => "user",
        Role::Model => "model",
        Role::ToolResult => "function",
    }
}

/// Consecutive entries with the same role share one `Content`.
fn push_parts(contents: &mut Vec<Content>, role: &str, parts: &[TurnPart]) {
    let converted: Vec<Part> = parts
        .iter()
        .filter_map(|part| match part {
            TurnPart::Text(text) if text.is_empty() => None,
            TurnPart::Text(text) => Some(Part::text(text.clone())),
            TurnPart::ToolCall(call) => Some(Part {
                function_call: Some(FunctionCall {
                    name: call.name.clone(),
                    args: call.args.clone(),
                }),
                ..Part::default()
            }),
            TurnPart::ToolResult(result) => Some(Part {
                function_response: Some(FunctionResponse {
                    name: result.name.clone(),
                    response: result.payload(),
                }),
                ..Part::default()
            }),
        })
        .collect();

    if converted.is_empty() {
        return;
    }

    match contents.last_mut() {
        Some(last) if last.role == role => last.parts.extend(converted),
        _ => contents.push(Content {
            role: role.to_string(),
            parts: converted,
        }),
    }
}

/// Accumulates one response (or a stream of partial ones)
#[derive(Default)]
struct ResponseCollector {
    text: String,
    calls: Vec<RequestedCall>,
    blocked: bool,
    saw_candidate: bool,
}

impl ResponseCollector {
    /// Returns the new text fragments contained in `response`
    fn absorb(&mut self, response: &GeminiResponse) -> Vec<String> {
        let mut fragments = Vec::new();

        if response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_ref())
            .is_some()
        {
            self.blocked = true;
        }

        for candidate in &response.candidates {
            self.saw_candidate = true;

            if let Some(reason) = candidate.finish_reason.as_deref() {
                if BLOCKING_FINISH_REASONS.contains(&reason) {
                    warn!(finish_reason = reason, "Gemini declined to answer");
                    self.blocked = true;
                }
            }

            let Some(content) = &candidate.content else {
                continue;
            };
            for part in &content.parts {
                if let Some(text) = &part.text {
                    if !text.is_empty() {
                        self.text.push_str(text);
                        fragments.push(text.clone());
                    }
                }
                if let Some(call) = &part.function_call {
                    self.calls.push(RequestedCall {
                        name: call.name.clone(),
                        args: call.args.clone(),
                    });
                }
            }
        }

        fragments
    }

    fn finish(self) -> Result<ModelResponse> {
        if !self.calls.is_empty() {
            return Ok(ModelResponse::ToolCallsRequested { calls: self.calls });
        }
        if self.blocked {
            return Ok(ModelResponse::FinalAnswer {
                text: REFUSAL_MESSAGE.to_string(),
            });
        }
        if !self.saw_candidate {
            return Err(OrchestrationError::SchemaViolation(
                "No candidates in Gemini response".to_string(),
            ));
        }
        Ok(ModelResponse::FinalAnswer { text: self.text })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSet>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: JsonMap,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}
