//! Streaming chat-completion backends
//!
//! Ollama streams newline-delimited JSON objects; OpenAI-compatible servers
//! stream server-sent events. Both are read line by line on a background task
//! and forwarded as tokens.

use std::fmt::Display;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{LanguageModel, TokenStream, endpoint};
use crate::pipeline::{ChatMessage, GenerationRequest};
use crate::{Error, Result};

/// LLM provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LlmProvider {
    Ollama,
    OpenAi,
}

/// A chat model reachable over HTTP
pub struct ChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    provider: LlmProvider,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChunk {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    delta: OpenAiDelta,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one line of a streamed response means
#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    Token(String),
    Skip,
    Done,
}

impl ChatModel {
    /// Create a model served by Ollama
    #[must_use]
    pub fn new_ollama(base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: None,
            model,
            provider: LlmProvider::Ollama,
        }
    }

    /// Create a model behind an OpenAI-compatible chat completions API
    #[must_use]
    pub fn new_openai(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            model,
            provider: LlmProvider::OpenAi,
        }
    }

    fn messages(request: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: request.system.clone(),
        });
        messages.extend(request.messages.iter().cloned());
        messages
    }

    async fn open(&self, request: &GenerationRequest) -> Result<reqwest::Response> {
        let builder = match self.provider {
            LlmProvider::Ollama => self
                .client
                .post(endpoint(&self.base_url, "/api/chat"))
                .json(&OllamaRequest {
                    model: &self.model,
                    messages: Self::messages(request),
                    stream: true,
                    options: OllamaOptions {
                        temperature: request.temperature,
                        num_predict: request.max_tokens,
                    },
                }),
            LlmProvider::OpenAi => {
                let builder = self
                    .client
                    .post(endpoint(&self.base_url, "/v1/chat/completions"))
                    .json(&OpenAiRequest {
                        model: &self.model,
                        messages: Self::messages(request),
                        stream: true,
                        max_tokens: request.max_tokens,
                        temperature: request.temperature,
                    });
                match &self.api_key {
                    Some(key) => builder.header("Authorization", format!("Bearer {key}")),
                    None => builder,
                }
            }
        };

        let response = builder.send().await.map_err(|e| {
            tracing::error!(model = %self.model, error = %e, "generation request failed");
            Error::GenerationUnavailable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "generation API error");
            return Err(Error::GenerationUnavailable(format!(
                "{} error {status}: {body}",
                self.name()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for ChatModel {
    fn name(&self) -> &'static str {
        match self.provider {
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenAi => "openai",
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let response = self.open(request).await?;
        let provider = self.provider;
        let (tx, rx) = mpsc::channel::<Result<String>>(32);

        tokio::spawn(pump(response.bytes_stream(), provider, tx));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Bytes of a streamed body, cut into whole lines
///
/// Lines are decoded only once complete, so a character split across two
/// network chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.bytes.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left after the last newline
    fn finish(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.bytes)).into_owned()
    }
}

const fn parse_line(provider: LlmProvider) -> fn(&str) -> Result<StreamLine> {
    match provider {
        LlmProvider::Ollama => parse_ndjson_line,
        LlmProvider::OpenAi => parse_sse_line,
    }
}

/// Forward tokens from a streamed body until it ends, fails or the receiver goes away
async fn pump<S, B, E>(mut bytes: S, provider: LlmProvider, tx: mpsc::Sender<Result<String>>)
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let parse = parse_line(provider);
    let mut buffer = LineBuffer::default();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(Error::GenerationUnavailable(e.to_string()))).await;
                return;
            }
        };
        buffer.push(chunk.as_ref());

        while let Some(line) = buffer.next_line() {
            match parse(&line) {
                Ok(StreamLine::Token(token)) => {
                    // Receiver dropped: generation was cancelled
                    if tx.send(Ok(token)).await.is_err() {
                        return;
                    }
                }
                Ok(StreamLine::Skip) => {}
                Ok(StreamLine::Done) => return,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    // Trailing line without a newline
    match parse(&buffer.finish()) {
        Ok(StreamLine::Token(token)) => {
            let _ = tx.send(Ok(token)).await;
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
        Ok(_) => {}
    }
}

fn parse_ndjson_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(StreamLine::Skip);
    }

    let chunk: OllamaChunk = serde_json::from_str(line)
        .map_err(|e| Error::GenerationUnavailable(format!("bad stream chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(Error::GenerationUnavailable(error));
    }

    let content = chunk.message.map(|m| m.content).unwrap_or_default();
    if !content.is_empty() {
        // Ollama may put the last token on the `done` chunk
        return Ok(StreamLine::Token(content));
    }
    if chunk.done {
        return Ok(StreamLine::Done);
    }
    Ok(StreamLine::Skip)
}

fn parse_sse_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let chunk: OpenAiChunk = serde_json::from_str(data)
        .map_err(|e| Error::GenerationUnavailable(format!("bad stream chunk: {e}")))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
        .map_or(StreamLine::Skip, StreamLine::Token))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pump_chunks(provider: LlmProvider, chunks: Vec<Vec<u8>>) -> Vec<String> {
        let (tx, rx) = mpsc::channel(16);
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, String>));
        pump(body, provider, tx).await;
        ReceiverStream::new(rx)
            .map(|token| token.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_character_split_across_chunks() {
        let line = concat!(
            r#"{"message":{"role":"assistant","content":"Café time."},"done":false}"#,
            "\n"
        );
        let bytes = line.as_bytes();
        // Cut between the two bytes of 'é'
        let cut = line.find('é').unwrap() + 1;

        let tokens = pump_chunks(
            LlmProvider::Ollama,
            vec![bytes[..cut].to_vec(), bytes[cut..].to_vec()],
        )
        .await;
        assert_eq!(tokens, vec!["Café time."]);
    }

    #[tokio::test]
    async fn test_sse_lines_across_chunks_and_tail() {
        let body = concat!(
            r#"data: {"choices":[{"delta":{"content":"Bonne "}}]}"#,
            "\n\n",
            r#"data: {"choices":[{"delta":{"content":"journée"}}]}"#
        );
        let chunks = body.as_bytes().chunks(7).map(<[u8]>::to_vec).collect();

        let tokens = pump_chunks(LlmProvider::OpenAi, chunks).await;
        assert_eq!(tokens, vec!["Bonne ", "journée"]);
    }

    #[test]
    fn test_parse_ndjson() {
        assert_eq!(
            parse_ndjson_line(r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#)
                .unwrap(),
            StreamLine::Token("Hi".to_string())
        );
        assert_eq!(
            parse_ndjson_line(r#"{"message":{"role":"assistant","content":""},"done":true}"#)
                .unwrap(),
            StreamLine::Done
        );
        assert_eq!(parse_ndjson_line("  \n").unwrap(), StreamLine::Skip);
        assert!(matches!(
            parse_ndjson_line(r#"{"error":"model not found"}"#),
            Err(Error::GenerationUnavailable(_))
        ));
    }

    #[test]
    fn test_parse_sse() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#).unwrap(),
            StreamLine::Token("Hello".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            StreamLine::Skip
        );
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), StreamLine::Skip);
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), StreamLine::Done);
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_system_message_first() {
        let request = GenerationRequest {
            system: "Be kind".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            max_tokens: 50,
            temperature: 0.5,
        };
        let messages = ChatModel::messages(&request);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hello");
    }
}
