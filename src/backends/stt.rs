//! Speech-to-text (STT) backends

use async_trait::async_trait;

use super::{Transcriber, endpoint};
use crate::pipeline::Transcript;
use crate::{Error, Result};

/// Response from a Whisper-compatible API with `response_format=verbose_json`
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(serde::Deserialize)]
struct WhisperSegment {
    avg_logprob: f64,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// STT provider backend
#[derive(Clone, Copy, Debug)]
enum SttProvider {
    Whisper,
    Deepgram,
}

/// Transcribes speech to text
pub struct SpeechToText {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    provider: SttProvider,
}

impl SpeechToText {
    /// Create a new STT instance for a Whisper-compatible endpoint
    ///
    /// Local servers (faster-whisper) need no key; the hosted API does.
    #[must_use]
    pub fn new_whisper(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            model,
            provider: SttProvider::Whisper,
        }
    }

    /// Create a new STT instance using Deepgram
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_deepgram(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: "https://api.deepgram.com".to_string(),
            api_key: Some(api_key),
            model,
            provider: SttProvider::Deepgram,
        })
    }

    /// Transcribe using a Whisper-compatible API
    async fn transcribe_whisper(&self, audio: &[u8]) -> Result<Transcript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::TranscriptionUnavailable(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        let mut request = self
            .client
            .post(endpoint(&self.base_url, "/v1/audio/transcriptions"))
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "Whisper request failed");
            Error::TranscriptionUnavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::TranscriptionUnavailable(format!(
                "Whisper API error {status}: {body}"
            )));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .map_err(|e| Error::TranscriptionUnavailable(e.to_string()))?;

        let logprobs: Vec<f64> = result.segments.iter().map(|s| s.avg_logprob).collect();
        let text = result.text.trim().to_string();
        let confidence = whisper_confidence(&text, &logprobs);

        tracing::info!(transcript = %text, confidence, "transcription complete");
        Ok(Transcript::new(text, confidence))
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8]) -> Result<Transcript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "{}?model={}&punctuate=true",
            endpoint(&self.base_url, "/v1/listen"),
            self.model
        );

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Token {}", self.api_key.as_deref().unwrap_or_default()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                Error::TranscriptionUnavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::TranscriptionUnavailable(format!(
                "Deepgram API error {status}: {body}"
            )));
        }

        let result: DeepgramResponse = response
            .json()
            .await
            .map_err(|e| Error::TranscriptionUnavailable(e.to_string()))?;

        let transcript = result
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map_or_else(
                || Transcript::new("", 0.0),
                |a| Transcript::new(a.transcript.trim(), a.confidence),
            );

        tracing::info!(
            transcript = %transcript.text,
            confidence = transcript.confidence,
            "transcription complete"
        );
        Ok(transcript)
    }
}

#[async_trait]
impl Transcriber for SpeechToText {
    fn name(&self) -> &'static str {
        match self.provider {
            SttProvider::Whisper => "whisper",
            SttProvider::Deepgram => "deepgram",
        }
    }

    async fn transcribe(&self, wav: &[u8]) -> Result<Transcript> {
        match self.provider {
            SttProvider::Whisper => self.transcribe_whisper(wav).await,
            SttProvider::Deepgram => self.transcribe_deepgram(wav).await,
        }
    }
}

/// Mean segment probability, `exp(avg_logprob)` averaged over segments
///
/// Empty text scores zero; text without segment data is taken at face value.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn whisper_confidence(text: &str, logprobs: &[f64]) -> f32 {
    if text.is_empty() {
        return 0.0;
    }
    if logprobs.is_empty() {
        return 1.0;
    }
    let mean = logprobs.iter().map(|lp| lp.exp()).sum::<f64>() / logprobs.len() as f64;
    mean.clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whisper_confidence() {
        assert!(whisper_confidence("", &[-0.1]) < f32::EPSILON);
        assert!((whisper_confidence("hi", &[]) - 1.0).abs() < f32::EPSILON);
        assert!((whisper_confidence("hi", &[0.0, 0.0]) - 1.0).abs() < 1e-6);

        let expected = f64::midpoint((-0.2f64).exp(), (-1.0f64).exp());
        #[allow(clippy::cast_possible_truncation)]
        let expected = expected as f32;
        assert!((whisper_confidence("hi", &[-0.2, -1.0]) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_parse_verbose_json() {
        let body = r#"{"text":" Hello there. ","language":"en","segments":[{"id":0,"avg_logprob":-0.25,"text":"Hello there."}]}"#;
        let parsed: WhisperResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.text.trim(), "Hello there.");
        assert_eq!(parsed.segments.len(), 1);
    }

    #[test]
    fn test_parse_deepgram() {
        let body = r#"{"results":{"channels":[{"alternatives":[{"transcript":"hello","confidence":0.93}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(body).unwrap();
        let alt = &parsed.results.channels[0].alternatives[0];
        assert_eq!(alt.transcript, "hello");
        assert!((alt.confidence - 0.93).abs() < f32::EPSILON);
    }

    #[test]
    fn test_deepgram_requires_key() {
        assert!(SpeechToText::new_deepgram(String::new(), "nova-2".to_string()).is_err());
    }
}
