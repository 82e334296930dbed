mod config;
mod context;
mod dispatcher;
mod prompts;
mod stream;
mod trace;
mod worker;

pub use config::{init_default_config, BatchConfig, CliOverrides, EmbeddingSettings};
pub use context::{
    BatchItem, ContextAssembler, ContextOptions, ContextProvider, ContextSnapshot, ContextSource,
    NoContext, ProjectEntry, ProjectMemory, ProviderRegistry,
};
pub use dispatcher::{DispatchEvent, DispatchStats, TaskDispatcher, DEFAULT_INTERVAL};
pub use prompts::{
    build_repair_prompt, render_prompt_structure, render_template, wrap_input, PartKind,
    Placeholders, PromptPart, PromptSet,
};
pub use stream::{
    fallback_extract, parse_complete, CotMarkers, Extraction, ParseState, ParsedResponse,
    StreamEvent, StreamParser,
};
pub use trace::TraceWriter;
pub use worker::{
    LogLevel, OperationType, Services, TranslationTask, TranslationWorker, WorkerEvent,
    WorkerOptions, WorkerOutcome, WorkerSink,
};
