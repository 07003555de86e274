//! Speech-to-text with a primary and a fallback remote provider.
//!
//! Primary is Gemini (audio understanding via `generateContent`), fallback is
//! OpenAI's transcription endpoint. Both prompts carry a best-effort listing
//! of the project tree so the model prefers technical vocabulary; the
//! transcript feeds a coding agent, not a chat log.

use crate::config::Config;
use crate::error::TranscribeError;
use base64::Engine as _;
use serde_json::{json, Value};
use std::path::Path;

/// Cap on file-tree entries appended to the transcription prompt.
const FILE_TREE_LIMIT: usize = 200;

/// Directory names never worth listing.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", ".git", "dist", ".venv"];

const INSTRUCTION: &str = "Transcribe this voice message verbatim. The text will be sent to a \
coding agent working in the project listed below, so when a word is ambiguous prefer technical \
and programming vocabulary (identifiers, file names, CLI tools) over literal phonetics. Reply \
with the transcription only.";

pub struct Transcriber {
    http: reqwest::Client,
    google_key: Option<String>,
    openai_key: Option<String>,
    model: String,
    google_base: String,
    openai_base: String,
}

impl Transcriber {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.google_api_key.clone(),
            config.openai_api_key.clone(),
            config.transcribe_model.clone(),
        )
    }

    pub fn new(google_key: Option<String>, openai_key: Option<String>, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            google_key,
            openai_key,
            model,
            google_base: "https://generativelanguage.googleapis.com".to_owned(),
            openai_base: "https://api.openai.com".to_owned(),
        }
    }

    #[cfg(test)]
    fn with_bases(mut self, google_base: &str, openai_base: &str) -> Self {
        self.google_base = google_base.to_owned();
        self.openai_base = openai_base.to_owned();
        self
    }

    /// Fetch the audio and transcribe it.
    pub async fn transcribe_url(
        &self,
        url: &str,
        mime: &str,
        directory: Option<&Path>,
    ) -> Result<String, TranscribeError> {
        let audio = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        self.transcribe(&audio, mime, directory).await
    }

    /// Transcribe raw audio bytes, trying the primary then the fallback.
    pub async fn transcribe(
        &self,
        audio: &[u8],
        mime: &str,
        directory: Option<&Path>,
    ) -> Result<String, TranscribeError> {
        if self.google_key.is_none() && self.openai_key.is_none() {
            return Err(TranscribeError::NoProvider);
        }

        let prompt = build_prompt(directory);
        let mut failures: Vec<String> = Vec::new();

        if let Some(key) = &self.google_key {
            match self.transcribe_gemini(key, audio, mime, &prompt).await {
                Ok(text) => return Ok(text),
                Err(error) => {
                    tracing::warn!(%error, "primary transcription provider failed");
                    failures.push(format!("gemini: {error}"));
                }
            }
        }

        if let Some(key) = &self.openai_key {
            match self.transcribe_openai(key, audio, mime, &prompt).await {
                Ok(text) => return Ok(text),
                Err(error) => {
                    tracing::warn!(%error, "fallback transcription provider failed");
                    failures.push(format!("openai: {error}"));
                }
            }
        }

        Err(TranscribeError::AllProvidersFailed(failures.join("; ")))
    }

    async fn transcribe_gemini(
        &self,
        key: &str,
        audio: &[u8],
        mime: &str,
        prompt: &str,
    ) -> anyhow::Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={key}",
            self.google_base, self.model
        );
        let body = json!({
            "contents": [{
                "parts": [
                    {"text": prompt},
                    {"inline_data": {
                        "mime_type": mime,
                        "data": base64::engine::general_purpose::STANDARD.encode(audio),
                    }}
                ]
            }]
        });

        let response: Value = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            anyhow::bail!("empty transcription response");
        }
        Ok(text.trim().to_owned())
    }

    async fn transcribe_openai(
        &self,
        key: &str,
        audio: &[u8],
        mime: &str,
        prompt: &str,
    ) -> anyhow::Result<String> {
        let filename = match mime {
            "audio/ogg" => "audio.ogg",
            "audio/mpeg" | "audio/mp3" => "audio.mp3",
            "audio/wav" | "audio/x-wav" => "audio.wav",
            "audio/webm" => "audio.webm",
            _ => "audio.bin",
        };

        let file = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name(filename)
            .mime_str(mime)?;
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", "gpt-4o-transcribe")
            .text("prompt", prompt.to_owned());

        let response: Value = self
            .http
            .post(format!("{}/v1/audio/transcriptions", self.openai_base))
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response["text"].as_str().unwrap_or_default();
        if text.trim().is_empty() {
            anyhow::bail!("empty transcription response");
        }
        Ok(text.trim().to_owned())
    }
}

fn build_prompt(directory: Option<&Path>) -> String {
    let mut prompt = INSTRUCTION.to_owned();
    if let Some(directory) = directory {
        let listing = file_tree(directory);
        if !listing.is_empty() {
            prompt.push_str("\n\nProject files:\n");
            prompt.push_str(&listing);
        }
    }
    prompt
}

/// Shallow project listing, bounded and best-effort.
fn file_tree(root: &Path) -> String {
    let mut entries: Vec<String> = Vec::new();
    collect_entries(root, root, 0, &mut entries);
    entries.truncate(FILE_TREE_LIMIT);
    entries.join("\n")
}

fn collect_entries(root: &Path, dir: &Path, depth: usize, out: &mut Vec<String>) {
    if depth > 3 || out.len() >= FILE_TREE_LIMIT {
        return;
    }
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    let mut children: Vec<_> = read.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for child in children {
        if out.len() >= FILE_TREE_LIMIT {
            return;
        }
        let name = child.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let path = child.path();
        if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().into_owned());
        }
        if path.is_dir() {
            collect_entries(root, &path, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "fix the parser bug"}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transcriber = Transcriber::new(Some("gk".into()), Some("ok".into()), "gemini-test".into())
            .with_bases(&server.uri(), &server.uri());
        let text = transcriber.transcribe(b"fake-audio", "audio/ogg", None).await.unwrap();
        assert_eq!(text, "fix the parser bug");
    }

    #[tokio::test]
    async fn falls_back_to_openai_when_primary_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1beta/models/.*:generateContent$"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/audio/transcriptions$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "rename the struct"})))
            .mount(&server)
            .await;

        let transcriber = Transcriber::new(Some("gk".into()), Some("ok".into()), "gemini-test".into())
            .with_bases(&server.uri(), &server.uri());
        let text = transcriber.transcribe(b"fake-audio", "audio/ogg", None).await.unwrap();
        assert_eq!(text, "rename the struct");
    }

    #[tokio::test]
    async fn reports_when_everything_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transcriber = Transcriber::new(Some("gk".into()), Some("ok".into()), "gemini-test".into())
            .with_bases(&server.uri(), &server.uri());
        let error = transcriber.transcribe(b"fake-audio", "audio/ogg", None).await.unwrap_err();
        assert!(matches!(error, TranscribeError::AllProvidersFailed(_)));
    }

    #[tokio::test]
    async fn no_keys_is_an_immediate_error() {
        let transcriber = Transcriber::new(None, None, "gemini-test".into());
        let error = transcriber.transcribe(b"fake-audio", "audio/ogg", None).await.unwrap_err();
        assert!(matches!(error, TranscribeError::NoProvider));
    }

    #[test]
    fn prompt_steers_toward_technical_vocabulary() {
        let prompt = build_prompt(None);
        assert!(prompt.contains("coding agent"));
        assert!(prompt.contains("programming vocabulary"));
    }
}
