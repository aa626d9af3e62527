//! Speech endpoints over HTTP.
//!
//! The transcriber posts raw little-endian PCM and expects `{"text": "..."}`.
//! The synthesizer posts `{"text": "..."}` and expects `{"audio": "<base64>"}`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{Synthesizer, Transcriber};

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl HttpTranscriber {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, samples: Vec<i16>, sample_rate: u32) -> Result<String> {
        let body: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/octet-stream")
            .header("x-sample-rate", sample_rate.to_string())
            .body(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.context("transcriber request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("transcriber returned {status}"));
        }
        let parsed: TranscriptionResponse = resp
            .json()
            .await
            .context("invalid transcriber response")?;
        Ok(parsed.text)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SynthesisResponse {
    audio: String,
}

impl HttpSynthesizer {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let mut request = self.client.post(&self.url).json(&SynthesisRequest { text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.context("synthesizer request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("synthesizer returned {status}"));
        }
        let parsed: SynthesisResponse = resp
            .json()
            .await
            .context("invalid synthesizer response")?;
        base64::engine::general_purpose::STANDARD
            .decode(parsed.audio.as_bytes())
            .context("synthesizer audio is not valid base64")
    }
}
