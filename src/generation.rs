//! Generation backends.
//!
//! A [`GenerationBackend`] turns a [`Prompt`] into raw answer text. It does
//! not validate citations or enforce timeouts; the composer does both.
//!
//! | Config Value | Backend | Notes |
//! |-------------|---------|-------|
//! | `"extractive"` | [`ExtractiveBackend`] | offline, deterministic; quotes passages with their ids |
//! | `"ollama"` | [`OllamaGenerator`] | `POST /api/generate`, `stream: false` |
//! | `"openai"` | [`OpenAiGenerator`] | chat completions, requires `OPENAI_API_KEY` |
//! | `"disabled"` | [`DisabledBackend`] | every call fails, answers degrade |

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::embedding::remote::{post_json_with_retry, DEFAULT_OLLAMA_URL};
use crate::error::{RagError, Result};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// One retrieved passage as presented to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPassage {
    pub chunk_id: String,
    pub text: String,
}

/// A fully assembled prompt. `text` is what remote models receive;
/// `passages` and `question` are the structured parts it was built from.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub text: String,
    pub question: String,
    pub passages: Vec<PromptPassage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum BackendStatus {
    Available,
    Unavailable(String),
    Disabled,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String>;

    /// Reachability probe for `/health`.
    async fn status(&self) -> BackendStatus {
        BackendStatus::Available
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn GenerationBackend>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveBackend::default())),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledBackend)),
        other => Err(RagError::InvalidConfiguration(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

fn required_model(config: &GenerationConfig) -> Result<String> {
    config.model.clone().ok_or_else(|| {
        RagError::InvalidConfiguration(format!(
            "generation.model required for the {} provider",
            config.provider
        ))
    })
}

fn build_client(config: &GenerationConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .build()
        .map_err(|e| RagError::InvalidConfiguration(format!("HTTP client: {}", e)))
}

// ============ Extractive ============

/// Builds an answer by quoting the leading sentence of each passage that
/// shares vocabulary with the question, tagged with its chunk id.
pub struct ExtractiveBackend {
    max_passages: usize,
    max_chars: usize,
}

impl Default for ExtractiveBackend {
    fn default() -> Self {
        Self {
            max_passages: 3,
            max_chars: 320,
        }
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

fn lead(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .find(|(i, c)| matches!(c, '.' | '?' | '!') && *i > 0)
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(trimmed.len());
    let sentence = &trimmed[..end];
    if sentence.chars().count() <= max_chars {
        sentence.to_string()
    } else {
        let cut: String = sentence.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

#[async_trait]
impl GenerationBackend for ExtractiveBackend {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let question_terms = terms(&prompt.question);
        let mut lines = Vec::new();
        for (i, passage) in prompt.passages.iter().enumerate() {
            if lines.len() >= self.max_passages {
                break;
            }
            let passage_terms = terms(&passage.text);
            let overlaps = question_terms.iter().any(|t| passage_terms.contains(t));
            // The top passage is always quoted; the rest only on overlap.
            if i == 0 || overlaps {
                lines.push(format!(
                    "{} [{}]",
                    lead(&passage.text, self.max_chars),
                    passage.chunk_id
                ));
            }
        }
        Ok(lines.join("\n"))
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            model: required_model(config)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            temperature: config.temperature,
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "system": prompt.system,
            "prompt": prompt.text,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/generate", self.url),
            None,
            &body,
            0,
            "Ollama",
        )
        .await
        .map_err(RagError::GenerationBackend)?;

        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| RagError::GenerationBackend("Ollama response missing 'response'".into()))
    }

    async fn status(&self) -> BackendStatus {
        match self.client.get(format!("{}/api/tags", self.url)).send().await {
            Ok(resp) if resp.status().is_success() => BackendStatus::Available,
            Ok(resp) => BackendStatus::Unavailable(format!("HTTP {}", resp.status())),
            Err(e) => BackendStatus::Unavailable(e.to_string()),
        }
    }
}

// ============ OpenAI ============

pub struct OpenAiGenerator {
    model: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            RagError::InvalidConfiguration("OPENAI_API_KEY environment variable not set".into())
        })?;
        Ok(Self {
            model: required_model(config)?,
            api_key,
            temperature: config.temperature,
            client: build_client(config)?,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.text },
            ],
        });
        let json = post_json_with_retry(
            &self.client,
            OPENAI_CHAT_URL,
            Some(&self.api_key),
            &body,
            0,
            "OpenAI",
        )
        .await
        .map_err(RagError::GenerationBackend)?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| RagError::GenerationBackend("OpenAI response missing content".into()))
    }
}

// ============ Disabled ============

pub struct DisabledBackend;

#[async_trait]
impl GenerationBackend for DisabledBackend {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<String> {
        Err(RagError::GenerationBackend("generation is disabled".into()))
    }

    async fn status(&self) -> BackendStatus {
        BackendStatus::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    fn prompt(question: &str, passages: &[(&str, &str)]) -> Prompt {
        Prompt {
            system: String::new(),
            text: String::new(),
            question: question.into(),
            passages: passages
                .iter()
                .map(|(id, text)| PromptPassage {
                    chunk_id: id.to_string(),
                    text: text.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_extractive_cites_relevant_passages() {
        let out = ExtractiveBackend::default()
            .generate(&prompt(
                "Apa itu transaksi afiliasi?",
                &[
                    ("pojk-42#0000", "Transaksi afiliasi adalah transaksi dengan pihak terafiliasi. Detail lain."),
                    ("pojk-11#0003", "Rencana pemulihan bencana wajib diuji."),
                    ("pojk-42#0001", "Setiap transaksi afiliasi wajib diumumkan."),
                ],
            ))
            .await
            .unwrap();
        assert_eq!(
            out,
            "Transaksi afiliasi adalah transaksi dengan pihak terafiliasi. [pojk-42#0000]\n\
             Setiap transaksi afiliasi wajib diumumkan. [pojk-42#0001]"
        );
    }

    #[tokio::test]
    async fn test_extractive_empty_passages() {
        let out = ExtractiveBackend::default()
            .generate(&prompt("apa", &[]))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_lead_truncates_long_sentence() {
        let long = "kata ".repeat(200);
        let l = lead(&long, 20);
        assert!(l.ends_with('…'));
        assert!(l.chars().count() <= 21);
    }

    #[tokio::test]
    async fn test_disabled_backend_errors() {
        let err = DisabledBackend.generate(&prompt("q", &[])).await.unwrap_err();
        assert!(matches!(err, RagError::GenerationBackend(_)));
        assert_eq!(DisabledBackend.status().await, BackendStatus::Disabled);
    }

    #[tokio::test]
    async fn test_ollama_generate_against_local_server() {
        let app = Router::new().route(
            "/api/generate",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["stream"], false);
                Json(serde_json::json!({ "response": "Jawaban [a#0000]" }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let generator = OllamaGenerator::new(&GenerationConfig {
            provider: "ollama".into(),
            model: Some("llama3".into()),
            url: Some(format!("http://{}/", addr)),
            ..GenerationConfig::default()
        })
        .unwrap();
        let out = generator.generate(&prompt("q", &[])).await.unwrap();
        assert_eq!(out, "Jawaban [a#0000]");
    }

    #[test]
    fn test_factory() {
        assert_eq!(create_generator(&GenerationConfig::default()).unwrap().name(), "extractive");
        let err = create_generator(&GenerationConfig {
            provider: "gpt5".into(),
            ..GenerationConfig::default()
        });
        assert!(err.is_err());
    }
}
