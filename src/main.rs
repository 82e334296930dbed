use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexisync_ai::models::{CompletionApi, EmbeddingModel, HttpEmbeddingModel, OpenAiCompatClient};
use lexisync_ai::pipeline::{
    init_default_config, BatchConfig, BatchItem, CliOverrides, ContextAssembler, DispatchEvent,
    ProjectEntry, ProjectMemory, Services, TaskDispatcher, TraceWriter, WorkerOutcome,
};
use lexisync_ai::progress::ConsoleProgress;
use lexisync_ai::quality::{DefaultValidator, ValidationIssue};
use lexisync_ai::retrieval::{
    CorpusItem, DenseBackend, EmbeddingCache, LexicalBackend, ProgressFn, RetrievalCore,
};
use lexisync_ai::terminology::{Glossary, GlossaryEntry};

#[derive(Parser, Debug)]
#[command(name = "lexisync-ai")]
#[command(about = "Batch AI translation of project strings with glossary and translation-memory context", long_about = None)]
struct Args {
    /// Generate default config + prompt files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config/prompt files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing config/prompt files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Items JSON: [{"id", "source", "translation"?, "ignored"?}]
    #[arg(value_name = "ITEMS.json")]
    input: Option<PathBuf>,

    /// Results JSON (default: <input_stem>.translated.json)
    #[arg(short, long, value_name = "JSON")]
    output: Option<PathBuf>,

    /// Config file path (default: search for lexisync-ai.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source language name (e.g. English)
    #[arg(long)]
    source_lang: Option<String>,

    /// Target language name (e.g. German)
    #[arg(long)]
    target_lang: Option<String>,

    /// Concurrent requests
    #[arg(long)]
    concurrency: Option<usize>,

    /// Self-repair attempts after a failed validation
    #[arg(long)]
    repair_limit: Option<usize>,

    /// Use blocking completions instead of streaming
    #[arg(long)]
    no_stream: bool,

    /// Ask the model for separated reasoning and answer sections
    #[arg(long)]
    cot: bool,

    /// Glossary JSON: [{"term", "translation"}]
    #[arg(long, value_name = "JSON")]
    glossary: Option<PathBuf>,

    /// Translation memory JSON for similar-text retrieval: [{"source", "target"}]
    #[arg(long, value_name = "JSON")]
    memory: Option<PathBuf>,

    /// auto | lexical | dense
    #[arg(long)]
    retrieval_mode: Option<String>,
}

#[derive(Serialize)]
struct ResultRow {
    id: String,
    text: Option<String>,
    error: Option<String>,
    issues: Vec<ValidationIssue>,
}

impl From<WorkerOutcome> for ResultRow {
    fn from(o: WorkerOutcome) -> Self {
        Self {
            id: o.id,
            text: o.text,
            error: o.error,
            issues: o.issues,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let progress = ConsoleProgress::new(true);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let input = match args.input.clone() {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  lexisync-ai --target-lang German items.json\n\nTIPS:\n  - Default config search: lexisync-ai.toml (upwards), or set LEXISYNC_AI_CONFIG.\n  - The API key can come from LEXISYNC_API_KEY.\n"
            );
            return Ok(());
        }
    };
    let output = match args.output.clone() {
        Some(p) => p,
        None => {
            let stem = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("items")
                .to_string();
            input.with_file_name(format!("{stem}.translated.json"))
        }
    };

    let cfg = BatchConfig::resolve(
        &input,
        &output,
        CliOverrides {
            config_path: args.config.clone(),
            source_lang: args.source_lang.clone(),
            target_lang: args.target_lang.clone(),
            concurrency: args.concurrency,
            repair_limit: args.repair_limit,
            no_stream: args.no_stream,
            cot: args.cot,
            retrieval_mode: args.retrieval_mode.clone(),
        },
    )
    .context("build config")?;
    info!(config = %cfg.config_path.display(), model = %cfg.model, target = %cfg.target_lang, "configuration resolved");

    let entries: Vec<ProjectEntry> = read_json(&input).context("read items")?;
    let glossary = match args.glossary.as_ref() {
        Some(p) => {
            let list: Vec<GlossaryEntry> = read_json(p).context("read glossary")?;
            Glossary::from_entries(list, cfg.glossary_case_sensitive)
        }
        None => Glossary::empty(),
    };
    progress.info(format!("glossary: {} term(s)", glossary.len()));

    let retrieval = build_retrieval(&cfg, args.memory.as_deref(), &entries).await?;
    let memory = Arc::new(ProjectMemory::new(entries.clone()));
    let mut assembler = ContextAssembler::new(Arc::new(glossary), memory.clone(), cfg.context.clone());
    if let Some(core) = retrieval {
        assembler = assembler.with_retrieval(core);
    }

    let api: Arc<dyn CompletionApi> = Arc::new(
        OpenAiCompatClient::new(cfg.api_key.clone().unwrap_or_default())
            .with_base_url(cfg.base_url.clone())
            .with_model(cfg.model.clone()),
    );
    if cfg.api_key.is_none() {
        warn!("no API key configured; requests are sent without authorization");
    }
    let trace = if cfg.trace_prompts {
        Some(Arc::new(TraceWriter::new(cfg.trace_dir.clone(), true)?))
    } else {
        None
    };
    let services = Services::new(api)
        .with_validator(Arc::new(DefaultValidator))
        .with_prompts(Arc::new(cfg.prompts.clone()))
        .with_cot(cfg.cot.clone())
        .with_trace(trace)
        .with_log_max_chars(cfg.log_max_chars);

    let items: Vec<BatchItem> = entries
        .iter()
        .filter(|e| !e.ignored && e.translation.as_deref().map_or(true, |t| t.trim().is_empty()))
        .map(|e| BatchItem {
            id: e.id.clone(),
            source_text: e.source.clone(),
            target_language: cfg.target_lang.clone(),
        })
        .collect();
    progress.info(format!(
        "{} of {} item(s) need translation",
        items.len(),
        entries.len()
    ));

    let dispatcher = TaskDispatcher::with_interval(Arc::new(services), cfg.interval);
    let mut events = dispatcher.subscribe();
    let stopper = dispatcher.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight items");
            stopper.stop();
        }
    });

    dispatcher.start_batch_with_source_language(
        items,
        Arc::new(assembler),
        cfg.concurrency,
        cfg.worker.clone(),
        cfg.source_lang.clone(),
    );

    let mut results = Vec::new();
    while let Some(event) = events.recv().await {
        progress.report(&event);
        match event {
            DispatchEvent::ItemResult(outcome) => {
                if let Some(text) = outcome.text.as_deref() {
                    memory.record_translation(&outcome.id, text);
                }
            }
            DispatchEvent::BatchFinished { results: r, .. } => {
                results = r;
                break;
            }
            _ => {}
        }
    }

    let rows: Vec<ResultRow> = results.into_iter().map(ResultRow::from).collect();
    let json = serde_json::to_string_pretty(&rows).context("serialize results")?;
    std::fs::write(&output, json).with_context(|| format!("write results: {}", output.display()))?;
    progress.info(format!("wrote {}", output.display()));
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse json: {}", path.display()))
}

/// Indexes the translation memory plus already translated project entries. None when there is
/// nothing to index.
async fn build_retrieval(
    cfg: &BatchConfig,
    memory_path: Option<&Path>,
    entries: &[ProjectEntry],
) -> anyhow::Result<Option<Arc<RetrievalCore>>> {
    let mut corpus: Vec<CorpusItem> = match memory_path {
        Some(p) => read_json(p).context("read translation memory")?,
        None => Vec::new(),
    };
    corpus.extend(entries.iter().filter(|e| !e.ignored).filter_map(|e| {
        let t = e.translation.as_deref()?.trim();
        (!t.is_empty()).then(|| CorpusItem {
            source: e.source.clone(),
            target: t.to_string(),
        })
    }));
    if corpus.is_empty() {
        return Ok(None);
    }

    let dense = cfg.embedding.as_ref().map(|emb| {
        let mut model = HttpEmbeddingModel::new(emb.base_url.clone(), emb.model.clone())
            .with_api_key(cfg.api_key.clone().unwrap_or_default());
        if let Some(dim) = emb.dim {
            model = model.with_dim(dim);
        }
        let model: Arc<dyn EmbeddingModel> = Arc::new(model);
        let cache = match EmbeddingCache::open(&emb.cache_path) {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                warn!(path = %emb.cache_path.display(), error = %e, "embedding cache unavailable; continuing without it");
                None
            }
        };
        DenseBackend::new(model, cache)
    });

    let core = RetrievalCore::new(LexicalBackend::new(), dense);
    let progress = ConsoleProgress::new(true);
    let report = |pct: u8| progress.progress("indexing", usize::from(pct), 100);
    let report: ProgressFn<'_> = &report;
    if !core.build_index(&corpus, Some(report), None).await {
        warn!("no usable retrieval index; similar translations are omitted");
    }
    Ok(Some(Arc::new(core)))
}
