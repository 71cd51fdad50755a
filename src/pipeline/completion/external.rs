//! External chat service backend
//!
//! The service keeps its own conversation state keyed by session id and
//! answers each turn with one complete reply string.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{CompletionRequest, LanguageModel, ModelResponse};
use crate::{Error, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    text: &'a str,
    #[serde(rename = "interactionCount")]
    interaction_count: u64,
    session_id: &'a str,
    #[serde(rename = "callerDetails")]
    caller_details: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    response: Option<String>,
}

/// Language model served by an HTTP chat endpoint
pub struct ExternalModel {
    client: reqwest::Client,
    url: String,
}

impl ExternalModel {
    #[must_use]
    pub const fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl LanguageModel for ExternalModel {
    async fn respond(&self, request: &CompletionRequest) -> Result<ModelResponse> {
        let body = ChatRequest {
            text: &request.text,
            interaction_count: request.interaction,
            session_id: &request.context.session_id,
            caller_details: &request.context.details,
        };

        let response = self.client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Completion(format!("chat service error {status}: {body}")));
        }

        let reply: ChatResponse = response.json().await?;
        match reply.response {
            Some(text) if !text.trim().is_empty() => Ok(ModelResponse::Whole(text)),
            _ => Err(Error::Completion("chat service returned no response".to_string())),
        }
    }
}
