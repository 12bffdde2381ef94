//! The inference backend seam.
//!
//! Backends are plain HTTP endpoints; everything the operator knows about
//! them is a URL, a payload format and the response shape contract below.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::WorkerError;

/// Inference can run for minutes on a loaded GPU box.
const BACKEND_TIMEOUT_SECS: u64 = 600;

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// POST a JSON body and return the parsed JSON response.
    async fn invoke(&self, url: &str, body: Value) -> Result<Value, WorkerError>;
}

pub struct HttpInferenceBackend {
    client: Client,
}

impl HttpInferenceBackend {
    pub fn new() -> Result<Self, WorkerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(BACKEND_TIMEOUT_SECS))
            .build()
            .map_err(|err| WorkerError::Backend(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceBackend {
    async fn invoke(&self, url: &str, body: Value) -> Result<Value, WorkerError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| WorkerError::Backend(err.to_string()))?;

        if !response.status().is_success() {
            return Err(WorkerError::Backend(format!(
                "{url} returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|err| WorkerError::Backend(format!("non-JSON response: {err}")))
    }
}

/// The one answer field a backend response must carry.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceOutput {
    /// Base64-encoded images.
    Images(Vec<String>),
    /// Filesystem paths to images the backend wrote locally.
    ImagePaths(Vec<String>),
    /// Filesystem path to an audio file.
    AudioPath(String),
    /// Chat-completion answer text.
    Content(String),
    /// Conversational answer text.
    Answer(String),
}

/// Extract the answer from a backend response.
///
/// Exactly one of `images`, `imgPaths`, `audioPath`, `content`, `answer`
/// must be present; anything else is a contract violation, not something to
/// guess around.
pub fn parse_output(response: &Value) -> Result<InferenceOutput, WorkerError> {
    let mut outputs = Vec::new();

    if let Some(images) = response.get("images").and_then(Value::as_array) {
        outputs.push(InferenceOutput::Images(string_items(images)?));
    }
    if let Some(paths) = response.get("imgPaths").and_then(Value::as_array) {
        outputs.push(InferenceOutput::ImagePaths(string_items(paths)?));
    }
    if let Some(path) = response.get("audioPath").and_then(Value::as_str) {
        outputs.push(InferenceOutput::AudioPath(path.to_string()));
    }
    if let Some(text) = response.get("content").and_then(Value::as_str) {
        outputs.push(InferenceOutput::Content(text.to_string()));
    }
    if let Some(text) = response.get("answer").and_then(Value::as_str) {
        outputs.push(InferenceOutput::Answer(text.to_string()));
    }

    match outputs.len() {
        1 => Ok(outputs.remove(0)),
        0 => Err(WorkerError::Backend(
            "response carries none of images/imgPaths/audioPath/content/answer".to_string(),
        )),
        n => Err(WorkerError::Backend(format!(
            "response carries {n} answer fields, expected exactly one"
        ))),
    }
}

fn string_items(values: &[Value]) -> Result<Vec<String>, WorkerError> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| WorkerError::Backend("non-string array item".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_answer_field_parses() {
        let out = parse_output(&json!({ "content": "hello" })).unwrap();
        assert_eq!(out, InferenceOutput::Content("hello".to_string()));

        let out = parse_output(&json!({ "images": ["aGVsbG8="] })).unwrap();
        assert_eq!(out, InferenceOutput::Images(vec!["aGVsbG8=".to_string()]));
    }

    #[test]
    fn zero_or_two_answer_fields_are_rejected() {
        assert!(parse_output(&json!({ "status": "ok" })).is_err());
        assert!(parse_output(&json!({ "content": "a", "answer": "b" })).is_err());
    }
}
