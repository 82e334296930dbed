use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::textutil::find_file_upwards;

pub const CONFIG_FILENAME: &str = "lexisync-ai.toml";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub prompts: PromptsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ApiSection {
    /// OpenAI-compatible endpoint root, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Falls back to `LEXISYNC_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub stream: Option<bool>,
    /// Chain-of-thought mode: ask for reasoning and answer in separate marked sections.
    #[serde(default)]
    pub cot: Option<bool>,
    #[serde(default)]
    pub cot_markers: Option<CotMarkerSection>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct CotMarkerSection {
    #[serde(default)]
    pub think_open: Option<String>,
    #[serde(default)]
    pub think_close: Option<String>,
    #[serde(default)]
    pub output_open: Option<String>,
    #[serde(default)]
    pub output_close: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct DispatchSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Delay between two dispatches, in milliseconds.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub repair_limit: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ContextSection {
    #[serde(default)]
    pub neighbors: Option<usize>,
    #[serde(default)]
    pub glossary_case_sensitive: Option<bool>,
    #[serde(default)]
    pub style_guide: Option<String>,
    #[serde(default)]
    pub source_lang: Option<String>,
    #[serde(default)]
    pub target_lang: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct RetrievalSection {
    /// `auto`, `lexical` or `dense`.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub threshold: Option<f32>,
    /// Embedding model id for the dense backend. Dense retrieval is off when unset.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Defaults to the `[api]` endpoint.
    #[serde(default)]
    pub embedding_base_url: Option<String>,
    #[serde(default)]
    pub embedding_dim: Option<usize>,
    /// SQLite file, relative to the config file.
    #[serde(default)]
    pub cache_path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default)]
    pub repair: Option<String>,
    #[serde(default)]
    pub cot: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    #[serde(default)]
    pub trace_dir: Option<String>,
    #[serde(default)]
    pub trace_prompts: Option<bool>,
    #[serde(default)]
    pub log_max_chars: Option<usize>,
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_leaves_other_sections_default() {
        let cfg: AppConfig = toml::from_str(
            "[dispatch]\nconcurrency = 4\n\n[retrieval]\nmode = \"lexical\"\nthreshold = 0.5\n",
        )
        .unwrap();
        assert_eq!(cfg.dispatch.concurrency, Some(4));
        assert_eq!(cfg.dispatch.interval_ms, None);
        assert_eq!(cfg.retrieval.mode.as_deref(), Some("lexical"));
        assert!(cfg.api.base_url.is_none());
        assert!(cfg.api.cot_markers.is_none());
    }

    #[test]
    fn load_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "[api\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse config toml"));
    }
}
