use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::config::{find_default_config, load_config, AppConfig, CONFIG_FILENAME};
use crate::pipeline::context::ContextOptions;
use crate::pipeline::prompts::{default_prompt_files, PromptSet, DEFAULT_PROMPTS_DIR};
use crate::pipeline::stream::CotMarkers;
use crate::pipeline::worker::WorkerOptions;
use crate::retrieval::RetrievalMode;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Command-line values that take precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub concurrency: Option<usize>,
    pub repair_limit: Option<usize>,
    pub no_stream: bool,
    pub cot: bool,
    pub retrieval_mode: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EmbeddingSettings {
    pub model: String,
    pub base_url: String,
    pub dim: Option<usize>,
    pub cache_path: PathBuf,
}

/// Settings for one batch, fixed before the batch starts.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub config_path: PathBuf,

    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,

    pub source_lang: Option<String>,
    pub target_lang: String,

    pub concurrency: usize,
    pub interval: Duration,
    pub worker: WorkerOptions,
    pub cot: Option<CotMarkers>,

    pub context: ContextOptions,
    pub glossary_case_sensitive: bool,
    pub embedding: Option<EmbeddingSettings>,

    pub trace_dir: PathBuf,
    pub trace_prompts: bool,
    pub log_max_chars: usize,

    pub prompts: PromptSet,
}

impl BatchConfig {
    pub fn resolve(input: &Path, output: &Path, cli: CliOverrides) -> anyhow::Result<Self> {
        let workdir = input
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let workdir = workdir.canonicalize().unwrap_or(workdir);

        let cfg_file = cli
            .config_path
            .clone()
            .or_else(|| std::env::var("LEXISYNC_AI_CONFIG").ok().map(PathBuf::from))
            .or_else(|| find_default_config(&workdir, CONFIG_FILENAME));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            if p.exists() {
                file_cfg = load_config(p)?;
            } else if cli.config_path.is_some() {
                return Err(anyhow!("config not found: {}", p.display()));
            }
        }
        let cfg_path = cfg_file.unwrap_or_else(|| workdir.join(CONFIG_FILENAME));
        let cfg_dir = cfg_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let target_lang = cli
            .target_lang
            .or_else(|| file_cfg.context.target_lang.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("no target language (use --target-lang or [context].target_lang)"))?;
        let source_lang = cli
            .source_lang
            .or_else(|| file_cfg.context.source_lang.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let api = &file_cfg.api;
        let base_url = non_blank(api.base_url.clone()).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = non_blank(api.api_key.clone())
            .or_else(|| non_blank(std::env::var("LEXISYNC_API_KEY").ok()));
        let model = non_blank(api.model.clone()).unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let worker = WorkerOptions {
            temperature: api.temperature,
            repair_limit: cli
                .repair_limit
                .or(file_cfg.dispatch.repair_limit)
                .unwrap_or(1),
            api_timeout: Duration::from_secs(api.timeout_secs.unwrap_or(60).max(1)),
            stream: !cli.no_stream && api.stream.unwrap_or(true),
        };
        let cot = (cli.cot || api.cot.unwrap_or(false)).then(|| {
            let mut m = CotMarkers::default();
            if let Some(c) = api.cot_markers.as_ref() {
                let pick = |v: &Option<String>, slot: &mut String| {
                    if let Some(v) = non_blank(v.clone()) {
                        *slot = v;
                    }
                };
                pick(&c.think_open, &mut m.think_open);
                pick(&c.think_close, &mut m.think_close);
                pick(&c.output_open, &mut m.output_open);
                pick(&c.output_close, &mut m.output_close);
            }
            m
        });

        let r = &file_cfg.retrieval;
        let context = ContextOptions {
            neighbors: file_cfg.context.neighbors.unwrap_or(3),
            style_guide: file_cfg.context.style_guide.clone().unwrap_or_default(),
            retrieval_mode: RetrievalMode::parse(cli.retrieval_mode.as_deref().or(r.mode.as_deref())),
            retrieval_limit: r.limit.unwrap_or(5),
            retrieval_threshold: r.threshold.unwrap_or(0.3).clamp(0.0, 1.0),
        };
        let embedding = non_blank(r.embedding_model.clone()).map(|model| EmbeddingSettings {
            model,
            base_url: non_blank(r.embedding_base_url.clone()).unwrap_or_else(|| base_url.clone()),
            dim: r.embedding_dim,
            cache_path: relative_to(
                &cfg_dir,
                r.cache_path.as_deref().unwrap_or("cache/embeddings.sqlite3"),
            ),
        });

        let output_dir = output
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| workdir.clone());
        let trace_dir = file_cfg
            .pipeline
            .trace_dir
            .clone()
            .unwrap_or_else(|| "_trace".to_string());
        let trace_dir = if Path::new(&trace_dir).is_absolute() {
            PathBuf::from(trace_dir)
        } else {
            output_dir.join(trace_dir)
        };

        let prompts = PromptSet::load(&cfg_path, &file_cfg).context("load prompts")?;

        Ok(Self {
            base_url,
            api_key,
            model,
            source_lang,
            target_lang,
            concurrency: cli
                .concurrency
                .or(file_cfg.dispatch.concurrency)
                .unwrap_or(1)
                .max(1),
            interval: Duration::from_millis(file_cfg.dispatch.interval_ms.unwrap_or(200)),
            worker,
            cot,
            context,
            glossary_case_sensitive: file_cfg.context.glossary_case_sensitive.unwrap_or(false),
            embedding,
            trace_dir,
            trace_prompts: file_cfg.pipeline.trace_prompts.unwrap_or(false),
            log_max_chars: file_cfg.pipeline.log_max_chars.unwrap_or(240),
            prompts,
            config_path: cfg_path,
        })
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn relative_to(base: &Path, p: &str) -> PathBuf {
    let p = PathBuf::from(p);
    if p.is_relative() {
        base.join(p)
    } else {
        p
    }
}

/// Writes a default config and prompt files into `dir`. Existing files are kept unless `force`.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;

    for (fname, body) in default_prompt_files()? {
        let p = prompts_dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write prompt: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

const DEFAULT_CONFIG_TOML: &str = r#"[api]
base_url = "https://api.openai.com/v1"
# api_key = "sk-..."   # or set LEXISYNC_API_KEY
model = "gpt-4o-mini"
temperature = 0.3
timeout_secs = 60
stream = true
# Ask for reasoning and answer in separate marked sections.
cot = false

# [api.cot_markers]
# think_open = "<thinking>"
# think_close = "</thinking>"
# output_open = "<translation>"
# output_close = "</translation>"

[dispatch]
concurrency = 1
interval_ms = 200
repair_limit = 1

[context]
# source_lang = "English"
# target_lang = "German"
neighbors = 3
glossary_case_sensitive = false
# style_guide = "Formal register. Keep UI labels short."

[retrieval]
mode = "auto"
limit = 5
threshold = 0.3
# Dense retrieval is enabled by naming an embedding model.
# embedding_model = "multilingual-e5-small"
# embedding_base_url = "http://127.0.0.1:8080/v1"
cache_path = "cache/embeddings.sqlite3"

[prompts]
translate = "prompts/translate.toml"
repair = "prompts/repair.toml"
cot = "prompts/cot.txt"

[pipeline]
trace_dir = "_trace"
trace_prompts = false
log_max_chars = 240
"#;
