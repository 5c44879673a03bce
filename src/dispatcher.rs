//! Transcription dispatch
//!
//! Sends merged WAV containers to a transcription backend. A custom
//! in-process transcriber callback takes precedence when installed;
//! otherwise the container goes to the remote HTTP API as a multipart
//! upload. An optional ffmpeg pre-pass strips silence first and
//! short-circuits uploads that carry no audible speech.

use futures_util::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RemoteApiConfig;
use crate::error::PipelineError;

/// Result of a transcription call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub text: Option<String>,
    pub language: Option<String>,
}

impl Transcript {
    /// Fold `other` into `self`: text is replaced when present, language
    /// is only adopted if none is known yet.
    pub fn merge_from(&mut self, other: Transcript) {
        if other.text.is_some() {
            self.text = other.text;
        }
        if self.language.is_none() {
            self.language = other.language;
        }
    }
}

/// In-process replacement for the HTTP backend.
pub type CustomTranscriber = Arc<
    dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Transcript, PipelineError>> + Send + Sync,
>;

/// What happened to a dispatched container.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The silence pre-pass left nothing worth uploading; the original
    /// container is handed back untouched.
    NoSpeech { original: Vec<u8> },
    Transcribed(Transcript),
}

pub struct TranscriptionDispatcher {
    client: Client,
    config: RemoteApiConfig,
    custom: Option<CustomTranscriber>,
}

impl TranscriptionDispatcher {
    pub fn new(config: RemoteApiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            custom: None,
        }
    }

    /// Install an in-process transcriber that bypasses the HTTP backend.
    pub fn set_custom_transcriber(&mut self, transcriber: CustomTranscriber) {
        self.custom = Some(transcriber);
    }

    /// Dispatch one merged WAV container.
    pub async fn send(&self, wav_bytes: Vec<u8>) -> Result<DispatchOutcome, PipelineError> {
        let payload = if self.config.remove_silence {
            match self.strip_silence(&wav_bytes).await? {
                Some(trimmed) => trimmed,
                None => return Ok(DispatchOutcome::NoSpeech { original: wav_bytes }),
            }
        } else {
            wav_bytes
        };

        if let Some(custom) = &self.custom {
            let transcript = custom(payload).await?;
            return Ok(DispatchOutcome::Transcribed(transcript));
        }

        self.send_remote(payload).await.map(DispatchOutcome::Transcribed)
    }

    async fn send_remote(&self, payload: Vec<u8>) -> Result<Transcript, PipelineError> {
        let part = reqwest::multipart::Part::bytes(payload)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Network(format!("failed to build upload: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);

        let mut request = self.client.post(&self.config.endpoint).multipart(form);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("transcription request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Network(format!(
                "transcription API returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Network(format!("invalid API response: {}", e)))?;

        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string());
        let language = payload
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Transcript { text, language })
    }

    /// Run ffmpeg's silenceremove filter over the container.
    ///
    /// Returns `Ok(None)` when the trimmed output falls below the
    /// configured minimum size, meaning no audible speech survived.
    /// Falls back to the untrimmed container if ffmpeg itself fails.
    async fn strip_silence(&self, wav_bytes: &[u8]) -> Result<Option<Vec<u8>>, PipelineError> {
        let dir = std::env::temp_dir();
        let stamp = chrono::Utc::now().timestamp_micros();
        let input: PathBuf = dir.join(format!("murmur-{}.wav", stamp));
        let output: PathBuf = dir.join(format!("murmur-{}-trimmed.mp3", stamp));

        tokio::fs::write(&input, wav_bytes).await?;

        let result = tokio::process::Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(&input)
            .arg("-af")
            .arg("silenceremove=start_periods=1:stop_periods=-1:start_threshold=-50dB:stop_threshold=-50dB:start_silence=0.3:stop_silence=0.3")
            .arg(&output)
            .output()
            .await;

        let trimmed = match result {
            Ok(out) if out.status.success() => match tokio::fs::read(&output).await {
                Ok(bytes) if bytes.len() as u64 >= self.config.min_file_bytes => Some(bytes),
                Ok(_) => None,
                Err(e) => {
                    eprintln!("Failed to read silence-trimmed audio: {}", e);
                    Some(wav_bytes.to_vec())
                }
            },
            Ok(out) => {
                eprintln!(
                    "ffmpeg silence removal failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                Some(wav_bytes.to_vec())
            }
            Err(e) => {
                eprintln!("Could not launch ffmpeg, skipping silence removal: {}", e);
                Some(wav_bytes.to_vec())
            }
        };

        let _ = tokio::fs::remove_file(&input).await;
        let _ = tokio::fs::remove_file(&output).await;

        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> RemoteApiConfig {
        RemoteApiConfig {
            endpoint: "http://127.0.0.1:1/v1/audio/transcriptions".to_string(),
            model: "whisper-1".to_string(),
            api_key: String::new(),
            remove_silence: false,
            min_file_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn custom_transcriber_takes_precedence_over_http() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_seen = calls.clone();

        let mut dispatcher = TranscriptionDispatcher::new(test_config());
        dispatcher.set_custom_transcriber(Arc::new(move |bytes| {
            let calls = calls_seen.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Transcript {
                    text: Some(format!("{} bytes", bytes.len())),
                    language: Some("en".to_string()),
                })
            })
        }));

        // The endpoint is unroutable; reaching it would fail the test.
        let outcome = dispatcher.send(vec![0u8; 44]).await.unwrap();
        match outcome {
            DispatchOutcome::Transcribed(t) => {
                assert_eq!(t.text.as_deref(), Some("44 bytes"));
                assert_eq!(t.language.as_deref(), Some("en"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn custom_transcriber_errors_propagate() {
        let mut dispatcher = TranscriptionDispatcher::new(test_config());
        dispatcher.set_custom_transcriber(Arc::new(|_| {
            Box::pin(async { Err(PipelineError::Network("backend down".to_string())) })
        }));

        let err = dispatcher.send(vec![0u8; 44]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Network(_)));
    }

    #[test]
    fn merge_from_replaces_text_and_keeps_first_language() {
        let mut acc = Transcript {
            text: Some("hello".to_string()),
            language: Some("en".to_string()),
        };
        acc.merge_from(Transcript {
            text: Some("hello world".to_string()),
            language: Some("de".to_string()),
        });
        assert_eq!(acc.text.as_deref(), Some("hello world"));
        assert_eq!(acc.language.as_deref(), Some("en"));

        let mut empty = Transcript::default();
        empty.merge_from(Transcript {
            text: None,
            language: Some("fr".to_string()),
        });
        assert_eq!(empty.text, None);
        assert_eq!(empty.language.as_deref(), Some("fr"));
    }
}
