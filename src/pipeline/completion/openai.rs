//! `OpenAI` chat completions backend with token streaming
//!
//! Keeps the message history of each call in memory between `begin_call` and
//! `end_call` so follow-up turns have context. Nothing is persisted.

use std::collections::VecDeque;
use std::fmt::Write as _;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{CompletionRequest, LanguageModel, ModelResponse};
use crate::config::CompletionConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
}

/// Streaming chat completions client
pub struct OpenAiModel {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    max_tokens: u32,
    system_prompt: String,
    histories: DashMap<String, Vec<ChatMessage>>,
}

impl OpenAiModel {
    /// Create a client from completion settings
    ///
    /// # Errors
    ///
    /// Returns error if no API key is configured
    pub fn new(client: reqwest::Client, config: &CompletionConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("OpenAI API key required for completions".to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            histories: DashMap::new(),
        })
    }

    fn messages(&self, request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut system = self.system_prompt.clone();
        if !request.context.details.is_empty() {
            system.push_str("\n\nCaller details:");
            let mut details: Vec<_> = request.context.details.iter().collect();
            details.sort();
            for (key, value) in details {
                let _ = write!(system, "\n- {key}: {value}");
            }
        }

        let mut messages = vec![ChatMessage {
            role: "system",
            content: system,
        }];
        if let Some(history) = self.histories.get(&request.context.session_id) {
            messages.extend(history.iter().cloned());
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.text.clone(),
        });
        messages
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn respond(&self, request: &CompletionRequest) -> Result<ModelResponse> {
        let messages = self.messages(request);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: self.max_tokens,
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Completion(format!("OpenAI error {status}: {body}")));
        }

        Ok(ModelResponse::Stream(sse_content_stream(response.bytes_stream())))
    }

    fn begin_call(&self, session_id: &str) {
        self.histories.entry(session_id.to_string()).or_default();
    }

    fn remember(&self, request: &CompletionRequest, reply: &str) {
        // a call that already ended must not get its history back
        let Some(mut history) = self.histories.get_mut(&request.context.session_id) else {
            return;
        };
        history.push(ChatMessage {
            role: "user",
            content: request.text.clone(),
        });
        history.push(ChatMessage {
            role: "assistant",
            content: reply.to_string(),
        });
    }

    fn end_call(&self, session_id: &str) {
        self.histories.remove(session_id);
    }
}

/// Parsed server-sent event line
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    serde_json::from_str::<serde_json::Value>(data)
        .ok()
        .and_then(|json| json["choices"][0]["delta"]["content"].as_str().map(str::to_string))
        .filter(|content| !content.is_empty())
        .map_or(SseLine::Skip, SseLine::Content)
}

struct SseState<S> {
    bytes: S,
    buffer: Vec<u8>,
    ready: VecDeque<String>,
    done: bool,
}

impl<S> SseState<S> {
    /// Move every complete line out of the byte buffer
    fn take_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.parse(&line);
            if self.done {
                return;
            }
        }
    }

    fn parse(&mut self, line: &[u8]) {
        match parse_sse_line(String::from_utf8_lossy(line).trim()) {
            SseLine::Content(text) => self.ready.push_back(text),
            SseLine::Done => self.done = true,
            SseLine::Skip => {}
        }
    }
}

/// Turn a chat completions event stream into content deltas
///
/// Lines are reassembled from raw bytes before decoding so multi-byte
/// characters split across network chunks survive intact.
fn sse_content_stream<S>(bytes: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(text) = state.ready.pop_front() {
                return Some((Ok(text), state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.take_lines();
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(Error::Http(e)), state));
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    state.parse(&rest);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{Router, body::Body, routing::post};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::pipeline::completion::{CallerContext, CompletionEvent, CompletionStreamer};

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn request(session_id: &str) -> CompletionRequest {
        let mut details = HashMap::new();
        details.insert("name".to_string(), "Ada".to_string());
        CompletionRequest {
            interaction: 1,
            text: "hi".to_string(),
            interruption: false,
            context: Arc::new(CallerContext {
                session_id: session_id.to_string(),
                details,
            }),
        }
    }

    fn chunked(parts: Vec<Vec<u8>>) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    fn delta(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    #[test]
    fn parses_sse_lines() {
        assert_eq!(parse_sse_line(delta("Hi").trim()), SseLine::Content("Hi".to_string()));
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[tokio::test]
    async fn reassembles_lines_split_mid_character() {
        let body = format!("{}{}data: [DONE]\n\n{}", delta("Sure•"), delta(" next"), delta("ignored"));
        let bytes = body.into_bytes();
        let marker_at = bytes.iter().position(|&b| b == 0xE2).unwrap();
        let parts = vec![bytes[..=marker_at].to_vec(), bytes[marker_at + 1..].to_vec()];

        let deltas: Vec<String> = sse_content_stream(chunked(parts))
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Sure•", " next"]);
    }

    #[test]
    fn history_is_kept_per_call() {
        let config = CompletionConfig {
            api_key: Some(SecretString::from("sk-test".to_string())),
            system_prompt: "Be brief.".to_string(),
            ..CompletionConfig::default()
        };
        let model = OpenAiModel::new(reqwest::Client::new(), &config).unwrap();
        let request = request("CA1");
        model.begin_call("CA1");

        let first = model.messages(&request);
        assert_eq!(first.len(), 2);
        assert!(first[0].content.contains("- name: Ada"));

        model.remember(&request, "Hello Ada");
        let second = model.messages(&request);
        assert_eq!(second.len(), 4);
        assert_eq!(second[2].role, "assistant");

        model.end_call("CA1");
        assert_eq!(model.messages(&request).len(), 2);

        model.remember(&request, "too late");
        assert!(model.histories.is_empty());
    }

    #[tokio::test]
    async fn hang_up_mid_reply_leaves_no_history() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async {
                let events = futures::stream::iter(["Hold on•", " still•", " talking•", " done"])
                    .then(|text| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, std::convert::Infallible>(delta(text))
                    });
                Body::from_stream(events)
            }),
        );
        let config = CompletionConfig {
            api_key: Some(SecretString::from("sk-test".to_string())),
            base_url: serve(router).await,
            ..CompletionConfig::default()
        };
        let model = Arc::new(OpenAiModel::new(reqwest::Client::new(), &config).unwrap());
        model.begin_call("CA-gone");

        let streamer = CompletionStreamer::new(Arc::clone(&model) as Arc<dyn LanguageModel>, &config);
        let (tx, mut rx) = mpsc::channel(4);
        let task = streamer.spawn(request("CA-gone"), tx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, CompletionEvent::Fragment(ref f) if f.text == "Hold on"));

        // the caller hangs up while the reply is still streaming
        drop(rx);
        model.end_call("CA-gone");
        task.await.unwrap();

        assert!(model.histories.is_empty());
    }

    #[test]
    fn missing_key_is_config_error() {
        let result = OpenAiModel::new(reqwest::Client::new(), &CompletionConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
