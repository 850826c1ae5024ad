//! Vision-LLM transcription of rendered pages.

use super::{BackendJob, ConversionBackend};
use crate::config::ConversionConfig;
use crate::error::HarvestError;
use crate::output::BackendKind;
use crate::pipeline::{encode, llm, pdf, postprocess};
use async_trait::async_trait;
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Environment variables whose presence means a provider can be auto-detected.
const PROVIDER_ENV_KEYS: &[&str] = &[
    "EDGEQUAKE_LLM_PROVIDER",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "AZURE_OPENAI_API_KEY",
    "MISTRAL_API_KEY",
    "OLLAMA_HOST",
];

pub struct LlmBackend {
    config: Arc<ConversionConfig>,
    provider: OnceCell<Arc<dyn LLMProvider>>,
}

impl LlmBackend {
    pub fn new(config: Arc<ConversionConfig>) -> Self {
        Self {
            config,
            provider: OnceCell::new(),
        }
    }

    fn provider(&self) -> Result<&Arc<dyn LLMProvider>, HarvestError> {
        self.provider.get_or_try_init(|| resolve_provider(&self.config))
    }
}

fn provider_configured(config: &ConversionConfig) -> bool {
    config.provider.is_some()
        || config.provider_name.is_some()
        || PROVIDER_ENV_KEYS
            .iter()
            .any(|k| std::env::var(k).map(|v| !v.is_empty()).unwrap_or(false))
}

fn create_vision_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, HarvestError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        HarvestError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: e.to_string(),
        }
    })
}

/// Resolve the LLM provider, most specific source first:
///
/// 1. a pre-built `config.provider`
/// 2. `config.provider_name` with `config.model`
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. `OPENAI_API_KEY`
/// 5. whatever [`ProviderFactory::from_env`] finds
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, HarvestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_vision_provider(&prov, &env_model);
        }
    }

    if std::env::var("OPENAI_API_KEY").map(|k| !k.is_empty()).unwrap_or(false) {
        return create_vision_provider("openai", model);
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| HarvestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "no provider could be detected; set OPENAI_API_KEY, ANTHROPIC_API_KEY or pass --provider ({})",
                e
            ),
        })?;
    Ok(provider)
}

#[async_trait]
impl ConversionBackend for LlmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LlmAssisted
    }

    fn is_available(&self) -> bool {
        provider_configured(&self.config) && pdf::engine_available(&self.config)
    }

    async fn convert(&self, pdf_path: &Path, job: &BackendJob) -> Result<String, HarvestError> {
        let provider = Arc::clone(self.provider()?);

        let path = pdf_path.to_path_buf();
        let config = Arc::clone(&self.config);
        let images = pdf::run_blocking(move || pdf::render_pages(&path, &config)).await?;
        let total = images.len();
        info!("LLM transcription of {} pages", total);

        let mut attachments = Vec::with_capacity(total);
        for (idx, img) in &images {
            let data = encode::page_attachment(img).map_err(|e| {
                HarvestError::RasterisationFailed {
                    page: idx + 1,
                    detail: e.to_string(),
                }
            })?;
            attachments.push((idx + 1, data));
        }
        drop(images);

        let config = Arc::clone(&self.config);
        let mut transcripts: Vec<llm::PageTranscript> = stream::iter(attachments)
            .map(|(page_num, data)| {
                let provider = Arc::clone(&provider);
                let config = Arc::clone(&config);
                async move { llm::process_page(&provider, page_num, total, data, &config).await }
            })
            .buffer_unordered(self.config.llm_concurrency.max(1))
            .collect()
            .await;
        transcripts.sort_by_key(|t| t.page_num);

        if !transcripts.is_empty() && transcripts.iter().all(|t| !t.is_ok()) {
            let detail = transcripts
                .iter()
                .find_map(|t| t.error.clone())
                .unwrap_or_default();
            return Err(HarvestError::ConversionFailed {
                backend: BackendKind::LlmAssisted.as_str().to_string(),
                detail: format!("every page failed: {}", detail),
            });
        }

        Ok(assemble(&job.stem, &transcripts))
    }
}

fn assemble(stem: &str, transcripts: &[llm::PageTranscript]) -> String {
    let mut out = format!("# {}\n\n", stem);
    for t in transcripts {
        out.push_str(&format!("## Page {}\n\n", t.page_num));
        match &t.error {
            None => out.push_str(&postprocess::clean_llm_page(&t.markdown)),
            Some(e) => {
                warn!("page {} dropped after {} retries", t.page_num, t.retries);
                out.push_str(&format!("*LLM transcription failed for this page: {}*", e));
            }
        }
        out.push_str("\n\n");
    }
    out.trim_end().to_string() + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(page_num: usize, markdown: &str, error: Option<&str>) -> llm::PageTranscript {
        llm::PageTranscript {
            page_num,
            markdown: markdown.to_string(),
            retries: 0,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn assemble_cleans_and_marks_failures() {
        let md = assemble(
            "memo",
            &[
                transcript(1, "```markdown\n### SUBJECT\nBody\n```", None),
                transcript(2, "", Some("rate limited")),
            ],
        );
        assert!(md.starts_with("# memo\n\n## Page 1\n\n### SUBJECT\nBody\n\n## Page 2\n\n"));
        assert!(md.contains("*LLM transcription failed for this page: rate limited*"));
    }

    #[test]
    fn named_provider_counts_as_configured() {
        let config = ConversionConfig {
            provider_name: Some("ollama".into()),
            ..Default::default()
        };
        assert!(provider_configured(&config));
    }
}
