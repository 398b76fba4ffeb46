#![forbid(unsafe_code)]

use parley_util::SecretString;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GEMINI_ENDPOINT: &str =
	"https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

#[derive(Debug, Error)]
pub enum CompletionError {
	#[error("assistant is not configured")]
	Unavailable,

	#[error("assistant request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("assistant returned an unusable response: {0}")]
	BadResponse(String),
}

#[async_trait::async_trait]
pub trait TextCompletion: Send + Sync {
	async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// Used when no API key is configured.
pub struct DisabledCompletion;

#[async_trait::async_trait]
impl TextCompletion for DisabledCompletion {
	async fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
		Err(CompletionError::Unavailable)
	}
}

pub struct GeminiCompletion {
	client: reqwest::Client,
	endpoint: String,
	api_key: SecretString,
}

impl GeminiCompletion {
	pub fn new(api_key: SecretString, endpoint: Option<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			endpoint: endpoint.unwrap_or_else(|| DEFAULT_GEMINI_ENDPOINT.to_string()),
			api_key,
		}
	}
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
	contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
	parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
	text: &'a str,
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
	text: Option<String>,
}

fn first_text(resp: GenerateResponse) -> Result<String, CompletionError> {
	resp.candidates
		.into_iter()
		.next()
		.and_then(|c| c.content)
		.and_then(|c| c.parts.into_iter().next())
		.and_then(|p| p.text)
		.ok_or_else(|| CompletionError::BadResponse("no candidate text".to_string()))
}

#[async_trait::async_trait]
impl TextCompletion for GeminiCompletion {
	async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
		let body = GenerateRequest {
			contents: vec![Content {
				parts: vec![Part { text: prompt }],
			}],
		};

		let resp = self
			.client
			.post(&self.endpoint)
			.header("x-goog-api-key", self.api_key.expose())
			.json(&body)
			.send()
			.await?;

		match resp.status() {
			StatusCode::OK => {
				let body: GenerateResponse = resp.json().await?;
				let text = first_text(body)?;
				debug!(chars = text.len(), "assistant: completion received");
				Ok(text)
			}
			status => Err(CompletionError::BadResponse(format!("status={status}"))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn extracts_first_candidate_text() {
		let resp: GenerateResponse = serde_json::from_value(serde_json::json!({
			"candidates": [
				{ "content": { "parts": [{ "text": "hello there" }, { "text": "ignored" }] } },
				{ "content": { "parts": [{ "text": "second" }] } }
			]
		}))
		.expect("parse");
		assert_eq!(first_text(resp).expect("text"), "hello there");
	}

	#[test]
	fn empty_candidates_are_bad_response() {
		let resp: GenerateResponse = serde_json::from_value(serde_json::json!({ "promptFeedback": {} })).expect("parse");
		match first_text(resp) {
			Err(CompletionError::BadResponse(_)) => {}
			other => panic!("expected BadResponse, got: {other:?}"),
		}
	}

	#[test]
	fn request_shape() {
		let body = GenerateRequest {
			contents: vec![Content {
				parts: vec![Part { text: "hi" }],
			}],
		};
		assert_eq!(
			serde_json::to_value(&body).expect("encode"),
			serde_json::json!({ "contents": [{ "parts": [{ "text": "hi" }] }] })
		);
	}

	#[tokio::test]
	async fn disabled_is_unavailable() {
		match DisabledCompletion.complete("hi").await {
			Err(CompletionError::Unavailable) => {}
			other => panic!("expected Unavailable, got: {other:?}"),
		}
	}
}
