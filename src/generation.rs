//! # Generation port
//!
//! Prompt in, answer out. The retrieval policy only depends on [`Generator`];
//! two backends ship with the crate:
//!
//! - [`OpenAiGenerator`]: any OpenAI-compatible chat-completions endpoint, via
//!   `async-openai`. The prompt is sent as a single user message.
//! - [`HttpGenerator`]: a bare JSON "generate" endpoint (Ollama style):
//!   `POST {"model", "prompt", "stream": false}` answered by `{"response": ...}`.
//!   Any non-2xx status, or a body carrying `"error"`, is a failure.
//!
//! Both report failures as [`MemoryError::Upstream`]; the policy never commits a
//! memory for a failed generation.
//!
//! A prompt may carry one image, base64 encoded without a `data:` prefix (see
//! [`encode_image`]). Only the generate endpoint forwards it, as an `"image"`
//! field next to the prompt.

use std::{fs, io, path::Path, sync::Arc};

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Backend, RecallConfig};
use crate::error::{MemoryError, Result};

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// `prompt` together with a base64 encoded image.
    async fn generate_with_image(&self, _prompt: &str, _image: &str) -> Result<String> {
        Err(MemoryError::Upstream(
            "this generation backend does not accept images".into(),
        ))
    }
}

/// Read an image file and encode it the way the generate endpoint expects.
pub fn encode_image(path: &Path) -> io::Result<String> {
    Ok(STANDARD.encode(fs::read(path)?))
}

/// Build the backend selected by `config.backend`.
pub fn from_config(config: &RecallConfig) -> Arc<dyn Generator> {
    match config.backend {
        Backend::OpenAi => Arc::new(OpenAiGenerator::new(config)),
        Backend::Generate => Arc::new(HttpGenerator::new(
            config.api_base.clone(),
            config.model.clone(),
        )),
    }
}

pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiGenerator {
    pub fn new(config: &RecallConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.api_base.clone());
        debug!("Client created with config: {:?}", openai_config);

        Self {
            client: Client::with_config(openai_config),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    #[allow(deprecated)]
    async fn generate(&self, prompt: &str) -> Result<String> {
        let message = ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
            content: ChatCompletionRequestUserMessageContent::Text(prompt.to_string()),
            name: None,
        });

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone()).messages(vec![message]);
        if let Some(max_tokens) = self.max_tokens {
            args.max_tokens(max_tokens);
        }
        let request = args
            .build()
            .map_err(|e| MemoryError::upstream("building chat request", e))?;

        debug!("Sending request: {:?}", request);

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| MemoryError::upstream("chat completion", e))?;

        let answer: String = response
            .choices
            .into_iter()
            .filter_map(|choice| choice.message.content)
            .collect();

        if answer.is_empty() {
            return Err(MemoryError::Upstream(
                "chat completion returned no content".into(),
            ));
        }
        Ok(answer)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
    error: Option<String>,
}

pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpGenerator {
    pub fn new(url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            model,
        }
    }

    async fn send(&self, prompt: &str, image: Option<&str>) -> Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            image,
            stream: false,
        };
        debug!(
            "POST {} ({} chars, image: {})",
            self.url,
            prompt.len(),
            image.is_some()
        );

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::upstream("sending generate request", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MemoryError::Upstream(format!(
                "generate endpoint returned {status}: {text}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::upstream("decoding generate response", e))?;

        match parsed {
            GenerateResponse {
                error: Some(error), ..
            } => Err(MemoryError::Upstream(error)),
            GenerateResponse {
                response: Some(answer),
                ..
            } => Ok(answer),
            _ => Err(MemoryError::Upstream(
                "generate response has no `response` field".into(),
            )),
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.send(prompt, None).await
    }

    async fn generate_with_image(&self, prompt: &str, image: &str) -> Result<String> {
        self.send(prompt, Some(image)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_generate_backend_returns_response_field() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body(json!({"model": "llama3", "prompt": "hi", "stream": false}));
                then.status(200)
                    .json_body(json!({"response": "hello there", "done": true}));
            })
            .await;

        let generator = HttpGenerator::new(server.url("/api/generate"), "llama3".into());
        assert_eq!(generator.generate("hi").await.unwrap(), "hello there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_generate_backend_forwards_image() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("cat.png");
        std::fs::write(&image_path, b"\x89PNG fake").unwrap();
        let image = encode_image(&image_path).unwrap();
        assert_eq!(image, "iVBORyBmYWtl");

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate").json_body(json!({
                    "model": "llava",
                    "prompt": "What is in this picture?",
                    "image": "iVBORyBmYWtl",
                    "stream": false
                }));
                then.status(200).json_body(json!({"response": "A cat."}));
            })
            .await;

        let generator = HttpGenerator::new(server.url("/api/generate"), "llava".into());
        assert_eq!(
            generator
                .generate_with_image("What is in this picture?", &image)
                .await
                .unwrap(),
            "A cat."
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_openai_backend_refuses_images() {
        let generator = OpenAiGenerator::new(&RecallConfig::default());
        let err = generator
            .generate_with_image("What is in this picture?", "aGk=")
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Upstream(ref msg) if msg.contains("images")));
    }

    #[tokio::test]
    async fn test_generate_backend_maps_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(503).body("model is loading");
            })
            .await;

        let generator = HttpGenerator::new(server.url("/api/generate"), "llama3".into());
        let err = generator.generate("hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::Upstream(ref msg) if msg.contains("model is loading")));
    }

    #[tokio::test]
    async fn test_generate_backend_maps_error_field() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).json_body(json!({"error": "unknown model"}));
            })
            .await;

        let generator = HttpGenerator::new(server.url("/api/generate"), "nope".into());
        let err = generator.generate("hi").await.unwrap_err();
        assert!(matches!(err, MemoryError::Upstream(ref msg) if msg == "unknown model"));
    }

    #[tokio::test]
    async fn test_openai_backend_reads_choice_content() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "created": 1700000000,
                    "model": "mock_model",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "Paris."},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
                }));
            })
            .await;

        let config = RecallConfig {
            api_base: server.url("/v1"),
            model: "mock_model".into(),
            ..RecallConfig::default()
        };
        let generator = OpenAiGenerator::new(&config);
        assert_eq!(
            generator
                .generate("What is the capital of France?")
                .await
                .unwrap(),
            "Paris."
        );
        mock.assert_async().await;
    }
}
