//! Attachment classification.
//!
//! Audio routes to transcription, images and PDFs are forwarded to the agent
//! as typed file parts, and small text-like files are inlined into the
//! prompt inside `<attachment>` envelopes.

use crate::agent::types::PromptPart;
use serenity::model::channel::Attachment;

/// Text-like MIME suffixes that get inlined rather than forwarded.
/// `x-yaml` covers the nonstandard alias some uploaders use for YAML.
const INLINE_APPLICATION_TYPES: &[&str] = &[
    "json",
    "xml",
    "javascript",
    "typescript",
    "yaml",
    "toml",
    "x-yaml",
];

/// Upper bound for inlined attachment bodies.
const INLINE_BYTE_LIMIT: usize = 64 * 1024;

/// An audio attachment routed to transcription.
#[derive(Debug, Clone)]
pub struct AudioAttachment {
    pub url: String,
    pub mime: String,
    pub filename: String,
}

/// Result of classifying a message's attachments.
#[derive(Debug, Default)]
pub struct Classified {
    /// Inlined text attachments, ready to append to the prompt.
    pub inline_text: String,
    /// Image/PDF parts forwarded to the agent.
    pub file_parts: Vec<PromptPart>,
    /// First audio attachment, if any.
    pub audio: Option<AudioAttachment>,
    pub had_audio: bool,
}

/// Classify attachments by MIME type, fetching text bodies over HTTP.
pub async fn classify(attachments: &[Attachment]) -> Classified {
    let mut classified = Classified::default();
    let http = reqwest::Client::new();

    for attachment in attachments {
        let mime = attachment
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime.starts_with("audio/") {
            if classified.audio.is_none() {
                classified.audio = Some(AudioAttachment {
                    url: attachment.url.clone(),
                    mime: mime.clone(),
                    filename: attachment.filename.clone(),
                });
                classified.had_audio = true;
            }
            continue;
        }

        if mime.starts_with("image/") || mime == "application/pdf" {
            classified.file_parts.push(PromptPart::File {
                mime,
                filename: attachment.filename.clone(),
                url: attachment.url.clone(),
            });
            continue;
        }

        if is_inline_text(&mime) {
            match fetch_text(&http, &attachment.url).await {
                Ok(body) => {
                    classified.inline_text.push_str(&format!(
                        "\n\n<attachment filename=\"{}\" mime=\"{}\">\n{}\n</attachment>",
                        attachment.filename, mime, body
                    ));
                }
                Err(error) => {
                    tracing::warn!(%error, filename = %attachment.filename, "failed to fetch attachment");
                }
            }
            continue;
        }

        tracing::debug!(filename = %attachment.filename, mime, "ignoring attachment");
    }

    classified
}

fn is_inline_text(mime: &str) -> bool {
    if mime.starts_with("text/") {
        return true;
    }
    mime.strip_prefix("application/")
        .is_some_and(|suffix| INLINE_APPLICATION_TYPES.contains(&suffix))
}

async fn fetch_text(http: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    let body = http.get(url).send().await?.error_for_status()?.text().await?;
    if body.len() > INLINE_BYTE_LIMIT {
        let mut cut = INLINE_BYTE_LIMIT;
        while cut > 0 && !body.is_char_boundary(cut) {
            cut -= 1;
        }
        return Ok(format!("{}\n… (truncated)", &body[..cut]));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_structured_mimes_are_inline() {
        assert!(is_inline_text("text/plain"));
        assert!(is_inline_text("text/markdown"));
        assert!(is_inline_text("application/json"));
        assert!(is_inline_text("application/toml"));
        assert!(!is_inline_text("application/pdf"));
        assert!(!is_inline_text("image/png"));
        assert!(!is_inline_text("audio/ogg"));
    }
}
