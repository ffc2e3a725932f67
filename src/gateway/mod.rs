//! Model gateway abstraction
//!
//! The model endpoint is a black box: given history and new input it either
//! answers or asks for tool calls. Implementations here:
//! - `GeminiGateway` for the real HTTP service
//! - `RetryingGateway` to add bounded backoff around any gateway
//! - `ScriptedGateway` for tests and offline demos

use crate::config::RetryPolicy;
use crate::error::OrchestrationError;
use crate::models::{ModelRequest, ModelResponse, StreamEvent};
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub mod gemini;
pub use gemini::GeminiGateway;

/// Trait for generative model calls
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn send(&self, request: ModelRequest) -> Result<ModelResponse>;

    /// Streaming variant: emits `TextDelta`s, then one `Completed` event, and
    /// returns the same final response. Text deltas are provisional until
    /// the call returns successfully.
    async fn send_streaming(
        &self,
        request: ModelRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ModelResponse> {
        let response = self.send(request).await?;
        if let ModelResponse::FinalAnswer { text } = &response {
            emit(&events, StreamEvent::TextDelta { chunk: text.clone() }).await;
        }
        emit(&events, StreamEvent::Completed(response.clone())).await;
        Ok(response)
    }
}

#[async_trait]
impl<G: ModelGateway + ?Sized> ModelGateway for Arc<G> {
    async fn send(&self, request: ModelRequest) -> Result<ModelResponse> {
        (**self).send(request).await
    }

    async fn send_streaming(
        &self,
        request: ModelRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ModelResponse> {
        (**self).send_streaming(request, events).await
    }
}

/// Send an event; a dropped receiver only means nobody is watching.
pub(crate) async fn emit(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    if events.send(event).await.is_err() {
        debug!("Stream receiver dropped");
    }
}

//
// ================= Retry =================
//

/// Retries `NetworkFailure` and `RateLimited` with exponential backoff.
/// A server-provided retry-after replaces the computed delay.
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: ModelGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Whether attempt number `attempt` (0-based) failing with `err` gets another try
    fn next_delay(&self, err: &OrchestrationError, attempt: u32) -> Option<std::time::Duration> {
        if !err.is_retryable() || attempt >= self.policy.max_retries {
            return None;
        }
        Some(err.retry_after().unwrap_or_else(|| self.policy.backoff(attempt)))
    }
}

#[async_trait]
impl<G: ModelGateway> ModelGateway for RetryingGateway<G> {
    async fn send(&self, request: ModelRequest) -> Result<ModelResponse> {
        let mut attempt = 0;
        loop {
            match self.inner.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => match self.next_delay(&e, attempt) {
                    Some(delay) => {
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Model call failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Retries only while no text has reached the caller; once a delta has
    /// been forwarded a retry would duplicate output.
    async fn send_streaming(
        &self,
        request: ModelRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ModelResponse> {
        let mut attempt = 0;
        loop {
            let (tx, mut rx) = mpsc::channel(64);
            let call = self.inner.send_streaming(request.clone(), tx);
            let forward = async {
                let mut forwarded = 0usize;
                while let Some(event) = rx.recv().await {
                    forwarded += 1;
                    emit(&events, event).await;
                }
                forwarded
            };

            let (result, forwarded) = tokio::join!(call, forward);

            match result {
                Ok(response) => return Ok(response),
                Err(e) if forwarded > 0 => return Err(e),
                Err(e) => match self.next_delay(&e, attempt) {
                    Some(delay) => {
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Streaming model call failed before output, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

//
// ================= Scripted =================
//

/// One scripted gateway reaction
#[derive(Debug)]
pub enum Scripted {
    Respond(ModelResponse),
    /// Stream `chunks` as deltas, then complete with `then`
    Stream {
        chunks: Vec<String>,
        then: ModelResponse,
    },
    Fail(OrchestrationError),
    /// Emit `chunks`, then never complete
    StallAfter(Vec<String>),
}

/// Deterministic gateway for tests and offline demos.
/// Keeps every request it receives.
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<ModelResponse>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedGateway {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same response
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().await.clone()
    }

    async fn next_step(&self, request: ModelRequest) -> Result<Scripted> {
        self.requests.lock().await.push(request);
        match self.script.lock().await.pop_front() {
            Some(step) => Ok(step),
            None => match &self.fallback {
                Some(response) => Ok(Scripted::Respond(response.clone())),
                None => Err(OrchestrationError::InvalidRequest(
                    "scripted gateway has no more responses".to_string(),
                )),
            },
        }
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn send(&self, request: ModelRequest) -> Result<ModelResponse> {
        match self.next_step(request).await? {
            Scripted::Respond(response) | Scripted::Stream { then: response, .. } => Ok(response),
            Scripted::Fail(e) => Err(e),
            Scripted::StallAfter(_) => futures::future::pending().await,
        }
    }

    async fn send_streaming(
        &self,
        request: ModelRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ModelResponse> {
        let (chunks, response) = match self.next_step(request).await? {
            Scripted::Respond(response) => {
                let chunks = match &response {
                    ModelResponse::FinalAnswer { text } => vec![text.clone()],
                    ModelResponse::ToolCallsRequested { .. } => Vec::new(),
                };
                (chunks, response)
            }
            Scripted::Stream { chunks, then } => (chunks, then),
            Scripted::Fail(e) => return Err(e),
            Scripted::StallAfter(chunks) => {
                for chunk in chunks {
                    emit(&events, StreamEvent::TextDelta { chunk }).await;
                }
                return futures::future::pending().await;
            }
        };

        for chunk in chunks {
            emit(&events, StreamEvent::TextDelta { chunk }).await;
        }
        emit(&events, StreamEvent::Completed(response.clone())).await;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Part, RequestedCall};
    use serde_json::json;
    use std::time::Duration;

    fn request() -> ModelRequest {
        ModelRequest {
            history: Vec::new(),
            tools: Vec::new(),
            new_input: vec![Part::Text("hi".into())],
        }
    }

    fn answer(text: &str) -> ModelResponse {
        ModelResponse::FinalAnswer {
            text: text.to_string(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_scripted_gateway_records_requests() {
        let gateway = ScriptedGateway::new(vec![Scripted::Respond(answer("ok"))]);
        assert_eq!(gateway.send(request()).await.unwrap(), answer("ok"));
        assert_eq!(gateway.requests().await.len(), 1);

        let err = gateway.send(request()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let inner = ScriptedGateway::new(vec![
            Scripted::Fail(OrchestrationError::NetworkFailure("reset".into())),
            Scripted::Fail(OrchestrationError::RateLimited {
                retry_after: Some(Duration::from_millis(2)),
            }),
            Scripted::Respond(answer("done")),
        ]);
        let gateway = RetryingGateway::new(inner, fast_policy(3));

        assert_eq!(gateway.send(request()).await.unwrap(), answer("done"));
        assert_eq!(gateway.inner.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let inner = ScriptedGateway::new(vec![
            Scripted::Fail(OrchestrationError::NetworkFailure("1".into())),
            Scripted::Fail(OrchestrationError::NetworkFailure("2".into())),
            Scripted::Respond(answer("too late")),
        ]);
        let gateway = RetryingGateway::new(inner, fast_policy(1));

        let err = gateway.send(request()).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::NetworkFailure(ref m) if m == "2"));
    }

    #[tokio::test]
    async fn test_invalid_request_not_retried() {
        let inner = ScriptedGateway::new(vec![
            Scripted::Fail(OrchestrationError::InvalidRequest("bad".into())),
            Scripted::Respond(answer("never")),
        ]);
        let gateway = RetryingGateway::new(inner, fast_policy(3));

        assert!(gateway.send(request()).await.is_err());
        assert_eq!(gateway.inner.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_default_streaming_emits_single_delta() {
        struct Plain;

        #[async_trait]
        impl ModelGateway for Plain {
            async fn send(&self, _request: ModelRequest) -> Result<ModelResponse> {
                Ok(ModelResponse::FinalAnswer {
                    text: "whole".into(),
                })
            }
        }

        let (tx, mut rx) = mpsc::channel(8);
        let response = Plain.send_streaming(request(), tx).await.unwrap();
        assert_eq!(response, answer("whole"));
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::TextDelta {
                chunk: "whole".into()
            })
        );
        assert_eq!(rx.recv().await, Some(StreamEvent::Completed(answer("whole"))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_streaming_retry_forwards_events() {
        let calls = ModelResponse::ToolCallsRequested {
            calls: vec![RequestedCall::new("getFinancialSummary", json!({}))],
        };
        let inner = ScriptedGateway::new(vec![
            Scripted::Fail(OrchestrationError::NetworkFailure("reset".into())),
            Scripted::Stream {
                chunks: vec!["Checking ".into()],
                then: calls.clone(),
            },
        ]);
        let gateway = RetryingGateway::new(inner, fast_policy(2));

        let (tx, mut rx) = mpsc::channel(8);
        let response = gateway.send_streaming(request(), tx).await.unwrap();
        assert_eq!(response, calls);
        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::TextDelta {
                chunk: "Checking ".into()
            })
        );
    }

    #[tokio::test]
    async fn test_repeating_gateway_never_runs_dry() {
        let gateway = ScriptedGateway::repeating(answer("again"));
        for _ in 0..3 {
            assert_eq!(gateway.send(request()).await.unwrap(), answer("again"));
        }
    }
}
