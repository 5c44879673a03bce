//! Model acquisition and caching
//!
//! Whisper GGML models come from the ggerganov/whisper.cpp HuggingFace
//! repository, the Silero VAD model from the snakers4/silero-vad GitHub
//! repository. Downloads stream to a `.downloading` temp file and are
//! renamed into place only once complete, so an interrupted fetch never
//! leaves a half-written model behind.

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::AsyncWriteExt;

use crate::error::PipelineError;

/// URL for the Silero VAD model
const SILERO_VAD_URL: &str =
    "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";

const SILERO_MODEL_FILENAME: &str = "silero_vad.onnx";

const WHISPER_CPP_REPO: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Supported Whisper model tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "tiny",
            ModelTier::Base => "base",
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large-v3",
        }
    }

    pub fn file_name(&self) -> String {
        format!("ggml-{}.bin", self.as_str())
    }

    pub fn download_url(&self) -> String {
        format!("{}/{}", WHISPER_CPP_REPO, self.file_name())
    }

    /// Rough model size, used for progress display before the server
    /// reports a content length.
    pub fn approx_size_mb(&self) -> u64 {
        match self {
            ModelTier::Tiny => 75,
            ModelTier::Base => 142,
            ModelTier::Small => 466,
            ModelTier::Medium => 1500,
            ModelTier::Large => 2900,
        }
    }
}

impl FromStr for ModelTier {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiny" | "tiny.en" => Ok(ModelTier::Tiny),
            "base" | "base.en" => Ok(ModelTier::Base),
            "small" | "small.en" => Ok(ModelTier::Small),
            "medium" | "medium.en" => Ok(ModelTier::Medium),
            "large" | "large-v1" | "large-v2" | "large-v3" => Ok(ModelTier::Large),
            other => Err(PipelineError::UnsupportedModel(other.to_string())),
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Get the model cache directory, creating it if needed.
///
/// The directory is versioned so a future cache layout change does not
/// trip over files written by older releases.
pub fn models_dir() -> Result<PathBuf, PipelineError> {
    let home_dir = std::env::var("HOME").map_err(|_| {
        PipelineError::Initialization("HOME environment variable is not set".to_string())
    })?;
    let models_dir = PathBuf::from(format!("{}/.cache/murmur/models-v1", home_dir));

    if !models_dir.exists() {
        println!("Creating models directory: {:?}", models_dir);
        fs::create_dir_all(&models_dir)?;
    }

    Ok(models_dir)
}

/// Download progress observer: `(downloaded_bytes, total_bytes)`.
/// `total_bytes` is 0 when the server did not report a length.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// Seam over model downloads so engine tests run without a network.
pub trait ModelFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        output_path: &'a Path,
        progress: ProgressFn,
    ) -> BoxFuture<'a, Result<(), PipelineError>>;
}

/// Production fetcher backed by reqwest.
pub struct HttpModelFetcher;

impl ModelFetcher for HttpModelFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        output_path: &'a Path,
        progress: ProgressFn,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(download_file(url, output_path, progress))
    }
}

/// Download a file from a URL and save it to the specified path.
pub async fn download_file(
    url: &str,
    output_path: &Path,
    mut progress: ProgressFn,
) -> Result<(), PipelineError> {
    println!("Downloading file from: {}", url);

    if let Some(parent) = output_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    // Stream into a temp file, rename into place once complete.
    let temp_path = output_path.with_extension("downloading");

    let response = reqwest::get(url)
        .await
        .map_err(|e| PipelineError::Network(format!("failed to download {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(PipelineError::Network(format!(
            "failed to download {}, status: {}",
            url,
            response.status()
        )));
    }

    let total_size = response.content_length().unwrap_or(0);
    let mut file = tokio::fs::File::create(&temp_path).await?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;

    while let Some(item) = stream.next().await {
        let chunk =
            item.map_err(|e| PipelineError::Network(format!("download interrupted: {}", e)))?;
        file.write_all(&chunk).await?;

        downloaded += chunk.len() as u64;
        progress(downloaded, total_size);
    }

    file.flush().await?;
    drop(file);

    fs::rename(&temp_path, output_path)?;

    if total_size > 0 {
        println!("Download complete: {}/{} bytes", downloaded, total_size);
    } else {
        println!("Download complete: {} bytes", downloaded);
    }

    Ok(())
}

/// Checks that a Silero model file exists and is not truncated.
fn is_silero_model_valid(model_path: &Path) -> bool {
    match fs::metadata(model_path) {
        Ok(metadata) => metadata.len() > 10_000,
        Err(_) => false,
    }
}

/// Download and initialize the Silero VAD model.
pub async fn init_silero_model() -> Result<PathBuf, PipelineError> {
    let models_dir = models_dir()?;
    let silero_model_path = models_dir.join(SILERO_MODEL_FILENAME);

    if is_silero_model_valid(&silero_model_path) {
        println!("Silero VAD model already exists at {:?}", silero_model_path);
        return Ok(silero_model_path);
    }

    println!("Downloading Silero VAD model...");
    download_file(SILERO_VAD_URL, &silero_model_path, Box::new(|_, _| {})).await?;

    if !is_silero_model_valid(&silero_model_path) {
        return Err(PipelineError::Initialization(
            "downloaded Silero model is invalid or corrupted".to_string(),
        ));
    }

    println!("Silero VAD model ready at: {:?}", silero_model_path);
    Ok(silero_model_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_accepts_aliases() {
        assert_eq!("tiny".parse::<ModelTier>().unwrap(), ModelTier::Tiny);
        assert_eq!("base.en".parse::<ModelTier>().unwrap(), ModelTier::Base);
        assert_eq!("large-v2".parse::<ModelTier>().unwrap(), ModelTier::Large);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        let err = "huge".parse::<ModelTier>().unwrap_err();
        match err {
            PipelineError::UnsupportedModel(name) => assert_eq!(name, "huge"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn download_url_points_at_ggml_file() {
        assert_eq!(
            ModelTier::Tiny.download_url(),
            "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.bin"
        );
        assert_eq!(ModelTier::Large.file_name(), "ggml-large-v3.bin");
    }
}
