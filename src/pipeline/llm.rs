//! Vision-model page transcription with retry.
//!
//! Transient provider errors (429/503 under load) are retried with
//! exponential backoff: `retry_backoff_ms * 2^(attempt-1)`.

use crate::config::ConversionConfig;
use crate::prompts::{page_instruction, ARCHIVE_PAGE_PROMPT};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Result of transcribing one page.
#[derive(Debug, Clone)]
pub struct PageTranscript {
    /// 1-indexed page number.
    pub page_num: usize,
    /// Raw model output; empty when `error` is set.
    pub markdown: String,
    pub retries: u32,
    pub error: Option<String>,
}

impl PageTranscript {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Transcribe a single page image.
///
/// Never fails: exhausted retries are reported through
/// [`PageTranscript::error`] so one bad page does not sink the document.
pub async fn process_page(
    provider: &Arc<dyn LLMProvider>,
    page_num: usize,
    total_pages: usize,
    image: ImageData,
    config: &ConversionConfig,
) -> PageTranscript {
    let start = Instant::now();
    let system_prompt = config
        .system_prompt
        .as_deref()
        .unwrap_or(ARCHIVE_PAGE_PROMPT);

    let messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user_with_images(page_instruction(page_num, total_pages), vec![image]),
    ];
    let options = build_options(config);

    let mut last_err = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "page {}: retry {}/{} in {}ms",
                page_num, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match provider.chat(&messages, Some(&options)).await {
            Ok(response) => {
                debug!(
                    "page {}: {} prompt / {} completion tokens in {:?}",
                    page_num,
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                return PageTranscript {
                    page_num,
                    markdown: response.content,
                    retries: attempt,
                    error: None,
                };
            }
            Err(e) => {
                warn!("page {}: attempt {} failed: {}", page_num, attempt + 1, e);
                last_err = Some(e.to_string());
            }
        }
    }

    PageTranscript {
        page_num,
        markdown: String::new(),
        retries: config.max_retries,
        error: Some(last_err.unwrap_or_else(|| "unknown error".to_string())),
    }
}

fn build_options(config: &ConversionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let config = ConversionConfig {
            temperature: 0.3,
            max_tokens: 1024,
            ..Default::default()
        };
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[test]
    fn transcript_ok_tracks_error() {
        let t = PageTranscript {
            page_num: 1,
            markdown: "x".into(),
            retries: 0,
            error: None,
        };
        assert!(t.is_ok());
    }
}
