//! Gemini `generateContent` client.
//!
//! Covers exactly what the translation steps need: one prompt in, one text
//! candidate out, with bounded retries on rate limits and server errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub type Result<T> = std::result::Result<T, GeminiError>;

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("Gemini API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Gemini network error: {0}")]
    Network(String),

    #[error("Gemini request timed out after {0:.1}s")]
    Timeout(f64),

    #[error("Gemini response had no text candidate")]
    EmptyResponse,
}

impl GeminiError {
    fn retryable(&self) -> bool {
        match self {
            GeminiError::Api { status, .. } => *status == 429 || *status >= 500,
            GeminiError::Network(_) | GeminiError::Timeout(_) => true,
            GeminiError::EmptyResponse => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    pub temperature: f64,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub model: String,
    pub timeout: f64,
    pub max_retries: u32,
    pub backoff_seconds: f64,
    pub temperature: f64,
}

impl Default for GeminiSettings {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_string(),
            timeout: 30.0,
            max_retries: 3,
            backoff_seconds: 2.0,
            temperature: 0.2,
        }
    }
}

pub struct GeminiClient {
    api_key: String,
    settings: GeminiSettings,
    http: reqwest::Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, settings: GeminiSettings) -> Self {
        Self {
            api_key: api_key.to_string(),
            settings,
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Send one prompt and return the first candidate's concatenated text.
    /// Rate limits and server errors are retried with linear backoff up to
    /// the configured limit.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.generate_once(prompt).await {
                Err(err) if err.retryable() && attempt <= self.settings.max_retries => {
                    let wait = self.settings.backoff_seconds * attempt as f64;
                    info!(
                        attempt,
                        max_retries = self.settings.max_retries,
                        wait_secs = format!("{wait:.1}"),
                        error = %err,
                        "Gemini request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                other => return other,
            }
        }
    }

    async fn generate_once(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.settings.model
        );
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.settings.temperature,
            },
        };

        debug!(model = %self.settings.model, prompt_chars = prompt.len(), "Gemini generate request");

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs_f64(self.settings.timeout))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GeminiError::Timeout(self.settings.timeout)
                } else {
                    GeminiError::Network(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(500);
            return Err(GeminiError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| GeminiError::Network(err.to_string()))?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            warn!("Gemini returned an empty candidate");
            return Err(GeminiError::EmptyResponse);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::Server) -> GeminiClient {
        GeminiClient::new(
            "test-key",
            GeminiSettings {
                backoff_seconds: 0.0,
                ..GeminiSettings::default()
            },
        )
        .with_base_url(&server.url())
    }

    fn candidate_json(text: &str) -> String {
        serde_json::json!({
            "candidates": [
                { "content": { "parts": [ { "text": text } ] } }
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn generate_extracts_candidate_text() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .match_header("x-goog-api-key", "test-key")
            .with_status(200)
            .with_body(candidate_json("translated text"))
            .create_async()
            .await;

        let text = client_for(&server).generate("translate this").await.unwrap();
        assert_eq!(text, "translated text");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .with_status(200)
            .with_body(candidate_json("ok"))
            .expect(1)
            .create_async()
            .await;

        let text = client_for(&server).generate("p").await.unwrap();
        assert_eq!(text, "ok");
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server).generate("p").await.unwrap_err();
        match err {
            GeminiError::Api { status: 400, body } => assert!(body.contains("bad request")),
            other => panic!("unexpected error: {other}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_candidates_surface_as_empty_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/models/gemini-1.5-flash:generateContent")
            .with_status(200)
            .with_body(r#"{"candidates": []}"#)
            .create_async()
            .await;

        let err = client_for(&server).generate("p").await.unwrap_err();
        assert!(matches!(err, GeminiError::EmptyResponse));
    }
}
