//! Streaming chat client.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Chat client holding the companion conversation.
///
/// Responses are requested in streaming mode; the caller reads the
/// line-framed event stream off the returned response body.
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
    model: String,
    system_prompt: String,
    history: Vec<Value>, // Conversation history as role/content pairs
    pending_user: Option<String>,
    max_history: usize,
}

impl ChatClient {
    /// Create a new chat client.
    ///
    /// # Arguments
    /// * `client` - Shared HTTP client
    /// * `url` - Chat completion endpoint
    /// * `model` - Model name
    /// * `system_prompt` - Companion persona preamble
    /// * `max_history` - Maximum retained exchanges
    pub fn new(client: reqwest::Client, url: String, model: String, system_prompt: String, max_history: usize) -> Self {
        info!("Chat endpoint: {} (model {})", url, model);
        Self { client, url, model, system_prompt, history: Vec::new(), pending_user: None, max_history }
    }

    /// Start a streaming completion for a user message.
    ///
    /// # Returns
    /// The raw HTTP response; its body is the event stream.
    ///
    /// # Errors
    /// Returns an error if the request fails or the endpoint rejects it.
    pub async fn begin_stream(&mut self, message: &str) -> Result<reqwest::Response> {
        debug!("User: {}", message);

        let mut messages = vec![json!({ "role": "system", "content": self.system_prompt })];
        messages.extend(self.history.iter().cloned());
        messages.push(json!({ "role": "user", "content": message }));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Chat request failed")?
            .error_for_status()
            .context("Chat endpoint rejected request")?;

        self.pending_user = Some(message.to_string());
        Ok(response)
    }

    /// Record the assembled assistant reply once the stream has ended.
    pub fn record_reply(&mut self, reply: &str) {
        debug!("Assistant: {}", reply);

        if let Some(user) = self.pending_user.take() {
            self.history.push(json!({ "role": "user", "content": user }));
            self.history.push(json!({ "role": "assistant", "content": reply }));
        }

        // Trim oldest exchanges beyond the limit
        while self.history.len() > self.max_history * 2 {
            self.history.remove(0);
            if !self.history.is_empty() {
                self.history.remove(0);
            }
        }
    }
}
