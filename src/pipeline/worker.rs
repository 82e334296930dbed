use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::models::{CompletionApi, CompletionRequest};
use crate::pipeline::context::{BatchItem, ContextSnapshot};
use crate::pipeline::prompts::{build_repair_prompt, wrap_input, PromptSet};
use crate::pipeline::stream::{CotMarkers, ParsedResponse, StreamEvent, StreamParser};
use crate::pipeline::trace::TraceWriter;
use crate::quality::{render_issues, DefaultValidator, ValidationIssue, Validator};
use crate::textutil::{clip_for_log, OuterWhitespace};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Translation,
    BatchTranslation,
    /// Rewrite an existing translation; sent without the input wrapper and never re-prompted.
    Fix,
}

impl OperationType {
    #[must_use]
    pub fn repair_eligible(self) -> bool {
        matches!(self, Self::Translation | Self::BatchTranslation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub temperature: Option<f32>,
    pub repair_limit: usize,
    pub api_timeout: Duration,
    pub stream: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            repair_limit: 1,
            api_timeout: Duration::from_secs(60),
            stream: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TranslationTask {
    pub id: String,
    pub op: OperationType,
    pub source_text: String,
    pub source_language: Option<String>,
    pub target_language: String,
    pub temperature: Option<f32>,
    pub repair_limit: usize,
    pub timeout: Duration,
    pub stream: bool,
}

impl TranslationTask {
    #[must_use]
    pub fn new(item: &BatchItem, op: OperationType, opts: &WorkerOptions) -> Self {
        Self {
            id: item.id.clone(),
            op,
            source_text: item.source_text.clone(),
            source_language: None,
            target_language: item.target_language.clone(),
            temperature: opts.temperature,
            repair_limit: opts.repair_limit,
            timeout: opts.api_timeout,
            stream: opts.stream,
        }
    }

    #[must_use]
    pub fn with_source_language(mut self, lang: Option<String>) -> Self {
        self.source_language = lang.filter(|l| !l.trim().is_empty());
        self
    }

    /// Upper bound on completion calls for this task.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        if self.op.repair_eligible() {
            self.repair_limit.saturating_add(1)
        } else {
            1
        }
    }
}

/// Collaborators shared by every worker of a batch.
pub struct Services {
    pub api: Arc<dyn CompletionApi>,
    pub validator: Arc<dyn Validator>,
    pub prompts: Arc<PromptSet>,
    /// Markers of the active chain-of-thought profile; None for plain answers.
    pub cot: Option<CotMarkers>,
    pub trace: Option<Arc<TraceWriter>>,
    pub log_max_chars: usize,
}

impl Services {
    #[must_use]
    pub fn new(api: Arc<dyn CompletionApi>) -> Self {
        Self {
            api,
            validator: Arc::new(DefaultValidator),
            prompts: Arc::new(PromptSet::default()),
            cot: None,
            trace: None,
            log_max_chars: 240,
        }
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_prompts(mut self, prompts: Arc<PromptSet>) -> Self {
        self.prompts = prompts;
        self
    }

    #[must_use]
    pub fn with_cot(mut self, markers: Option<CotMarkers>) -> Self {
        self.cot = markers;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: Option<Arc<TraceWriter>>) -> Self {
        self.trace = trace;
        self
    }

    #[must_use]
    pub fn with_log_max_chars(mut self, n: usize) -> Self {
        self.log_max_chars = n.max(1);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkerOutcome {
    pub id: String,
    pub op: OperationType,
    /// Final text with the source's outer whitespace; None when the task failed.
    pub text: Option<String>,
    pub error: Option<String>,
    /// Issues still open on the returned text.
    pub issues: Vec<ValidationIssue>,
    pub attempts: usize,
}

impl WorkerOutcome {
    #[must_use]
    pub fn failed(id: &str, op: OperationType, error: impl Into<String>, attempts: usize) -> Self {
        Self {
            id: id.to_string(),
            op,
            text: None,
            error: Some(error.into()),
            issues: Vec::new(),
            attempts,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Things a worker reports while it runs.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    Thinking,
    Fragment(String),
    Log { level: LogLevel, message: String },
}

pub type WorkerSink<'a> = &'a (dyn Fn(WorkerEvent) + Send + Sync);

pub struct TranslationWorker {
    task: TranslationTask,
    context: ContextSnapshot,
    services: Arc<Services>,
}

impl TranslationWorker {
    #[must_use]
    pub fn new(task: TranslationTask, context: ContextSnapshot, services: Arc<Services>) -> Self {
        Self {
            task,
            context,
            services,
        }
    }

    pub async fn run(self, sink: Option<WorkerSink<'_>>) -> WorkerOutcome {
        let task = &self.task;
        let svc = &self.services;
        let edges = OuterWhitespace::split(&task.source_text);
        if edges.core.is_empty() {
            return WorkerOutcome {
                id: task.id.clone(),
                op: task.op,
                text: Some(task.source_text.clone()),
                error: None,
                issues: Vec::new(),
                attempts: 0,
            };
        }

        let mut values = self.context.placeholders();
        values.insert(
            "Source Language".into(),
            task.source_language.clone().unwrap_or_default(),
        );
        values.insert("Target Language".into(), task.target_language.clone());
        let base_prompt = svc.prompts.system_prompt(&values, svc.cot.as_ref());
        let user_text = if task.op.repair_eligible() {
            wrap_input(edges.core, &task.target_language)
        } else {
            edges.core.to_string()
        };

        let max_attempts = task.max_attempts();
        let mut system_prompt = base_prompt.clone();
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            debug!(task = %task.id, attempt, max_attempts, "completion attempt");
            self.trace(attempt, "system", &system_prompt);
            self.trace(attempt, "user", &user_text);

            let req = CompletionRequest {
                system_prompt: system_prompt.clone(),
                user_text: user_text.clone(),
                temperature: task.temperature,
                timeout: Some(task.timeout),
            };
            let (parsed, raw) = match self.attempt(&req, sink).await {
                Ok(r) => r,
                Err(e) => {
                    let message = format!(
                        "'{}' failed: {e}",
                        clip_for_log(edges.core, svc.log_max_chars.min(40))
                    );
                    log(sink, LogLevel::Error, &message);
                    return WorkerOutcome::failed(&task.id, task.op, e.to_string(), attempt);
                }
            };
            self.trace(attempt, "response", &raw);
            debug!(task = %task.id, attempt, extraction = ?parsed.extraction, "response parsed");

            let candidate = edges.reapply(&parsed.text);
            if !task.op.repair_eligible() {
                return self.finish(candidate, Vec::new(), attempt);
            }

            let issues = svc.validator.validate(&candidate, &task.source_text);
            if issues.is_empty() || attempt >= max_attempts {
                if !issues.is_empty() {
                    warn!(task = %task.id, attempts = attempt, open = issues.len(), "repair budget exhausted");
                }
                return self.finish(candidate, issues, attempt);
            }

            let issue_list = render_issues(&issues);
            log(
                sink,
                LogLevel::Warning,
                &format!(
                    "Self-repair: '{}' failed validation. Issues:\n{issue_list}\nRetrying with correction prompt...",
                    clip_for_log(edges.core, 20)
                ),
            );
            system_prompt = build_repair_prompt(
                &base_prompt,
                &svc.prompts.repair,
                &values,
                edges.core,
                parsed.text.trim(),
                &issue_list,
            );
        }
    }

    /// One completion call, bounded by the task timeout. Returns the parsed answer and the raw
    /// response.
    async fn attempt(
        &self,
        req: &CompletionRequest,
        sink: Option<WorkerSink<'_>>,
    ) -> Result<(ParsedResponse, String), ApiError> {
        let api = &self.services.api;
        let mut parser = match self.services.cot.as_ref() {
            Some(m) => StreamParser::new(m.clone()),
            None => StreamParser::plain(),
        };
        let call = async {
            if self.task.stream {
                let mut stream = api.complete_stream(req).await?;
                while let Some(chunk) = stream.next().await {
                    for event in parser.push(&chunk?) {
                        if let Some(sink) = sink {
                            sink(match event {
                                StreamEvent::Thinking => WorkerEvent::Thinking,
                                StreamEvent::Text(t) => WorkerEvent::Fragment(t),
                            });
                        }
                    }
                }
            } else {
                let raw = api.complete(req).await?;
                let _ = parser.push(&raw);
            }
            Ok::<(), ApiError>(())
        };
        tokio::time::timeout(self.task.timeout, call)
            .await
            .map_err(|_| ApiError::Timeout(self.task.timeout))??;

        let raw = parser.raw().to_string();
        let parsed = parser.finish();
        if self.task.stream && !parsed.flush.is_empty() {
            if let Some(sink) = sink {
                sink(WorkerEvent::Fragment(parsed.flush.clone()));
            }
        }
        Ok((parsed, raw))
    }

    fn finish(&self, text: String, issues: Vec<ValidationIssue>, attempts: usize) -> WorkerOutcome {
        info!(
            task = %self.task.id,
            attempts,
            issues = issues.len(),
            "task done: {}",
            clip_for_log(&text, self.services.log_max_chars)
        );
        WorkerOutcome {
            id: self.task.id.clone(),
            op: self.task.op,
            text: Some(text),
            error: None,
            issues,
            attempts,
        }
    }

    fn trace(&self, attempt: usize, kind: &str, text: &str) {
        if let Some(trace) = self.services.trace.as_ref() {
            if let Err(e) = trace.write_attempt(&self.task.id, attempt, kind, text) {
                warn!(task = %self.task.id, error = %e, "trace write failed");
            }
        }
    }
}

fn log(sink: Option<WorkerSink<'_>>, level: LogLevel, message: &str) {
    match level {
        LogLevel::Error => warn!("{message}"),
        _ => info!("{message}"),
    }
    if let Some(sink) = sink {
        sink(WorkerEvent::Log {
            level,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::models::TextStream;
    use crate::quality::IssueKind;

    /// Replays canned responses and records every request.
    struct Scripted {
        replies: Mutex<VecDeque<Result<Vec<&'static str>, ()>>>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Vec<&'static str>, ()>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn next(&self, req: &CompletionRequest) -> Result<Vec<&'static str>, ApiError> {
            self.seen.lock().unwrap().push(req.clone());
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(chunks)) => Ok(chunks),
                Some(Err(())) => Err(ApiError::Status {
                    status: 503,
                    body: "overloaded".into(),
                }),
                None => Ok(vec!["exhausted"]),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionApi for Scripted {
        async fn complete(&self, req: &CompletionRequest) -> Result<String, ApiError> {
            Ok(self.next(req)?.concat())
        }

        async fn complete_stream(&self, req: &CompletionRequest) -> Result<TextStream, ApiError> {
            let chunks: Vec<Result<String, ApiError>> =
                self.next(req)?.into_iter().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    fn task(text: &str, op: OperationType, repair_limit: usize, stream: bool) -> TranslationTask {
        let item = BatchItem {
            id: "t1".into(),
            source_text: text.into(),
            target_language: "German".into(),
        };
        TranslationTask::new(
            &item,
            op,
            &WorkerOptions {
                repair_limit,
                stream,
                ..WorkerOptions::default()
            },
        )
    }

    async fn run(
        api: Arc<Scripted>,
        task: TranslationTask,
        cot: bool,
    ) -> (WorkerOutcome, Vec<WorkerEvent>) {
        let services = Services::new(api).with_cot(cot.then(CotMarkers::default));
        let events = Mutex::new(Vec::new());
        let sink: WorkerSink<'_> = &|e: WorkerEvent| events.lock().unwrap().push(e);
        let outcome = TranslationWorker::new(task, ContextSnapshot::default(), Arc::new(services))
            .run(Some(sink))
            .await;
        (outcome, events.into_inner().unwrap())
    }

    fn fragments(events: &[WorkerEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Fragment(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn streamed_cot_answer_keeps_outer_whitespace() {
        let api = Scripted::new(vec![Ok(vec![
            "<thinking>greeting",
            "</thinking><transl",
            "ation>\nHallo",
            " Welt</transla",
            "tion> trailing junk",
        ])]);
        let (outcome, events) = run(api.clone(), task("  Hello world\n", OperationType::BatchTranslation, 1, true), true).await;
        assert_eq!(outcome.text.as_deref(), Some("  Hallo Welt\n"));
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.issues.is_empty());
        assert_eq!(fragments(&events), "Hallo Welt");
        assert!(events.contains(&WorkerEvent::Thinking));
        assert!(events
            .iter()
            .all(|e| !matches!(e, WorkerEvent::Fragment(t) if t.contains('<'))));

        let seen = api.seen.lock().unwrap();
        assert!(seen[0].user_text.starts_with("<translate_input>\nHello world\n</translate_input>"));
        assert!(seen[0].system_prompt.contains("<thinking>"));
    }

    #[tokio::test]
    async fn invalid_candidate_triggers_bounded_repair() {
        let api = Scripted::new(vec![
            Ok(vec!["Hallo"]),
            Ok(vec!["Hallo Name"]),
            Ok(vec!["still wrong"]),
        ]);
        let (outcome, events) = run(api.clone(), task("Hello {name}", OperationType::Translation, 1, false), false).await;
        assert_eq!(api.calls(), 2);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.text.as_deref(), Some("Hallo Name"));
        assert!(outcome.issues.iter().any(|i| i.kind == IssueKind::Placeholder));
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkerEvent::Log { level: LogLevel::Warning, .. })));

        let seen = api.seen.lock().unwrap();
        assert!(seen[1].system_prompt.contains("Rejected translation:\nHallo"));
        assert!(seen[1].system_prompt.contains("CRITICAL AUTOMATION RULES"));
        assert_eq!(seen[0].user_text, seen[1].user_text);
    }

    #[tokio::test]
    async fn repair_stops_once_validation_passes() {
        let api = Scripted::new(vec![Ok(vec!["Hallo"]), Ok(vec!["Hallo {name}"])]);
        let (outcome, _) = run(api.clone(), task("Hello {name}", OperationType::Translation, 5, false), false).await;
        assert_eq!(api.calls(), 2);
        assert_eq!(outcome.text.as_deref(), Some("Hallo {name}"));
        assert!(outcome.issues.is_empty());
    }

    #[tokio::test]
    async fn warnings_also_trigger_repair() {
        let api = Scripted::new(vec![
            Ok(vec!["hallo Welt"]),
            Ok(vec!["hallo Welt"]),
            Ok(vec!["Hallo Welt."]),
        ]);
        let (outcome, _) = run(api.clone(), task("Hello world.", OperationType::Translation, 2, false), false).await;
        assert_eq!(api.calls(), 3);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.text.as_deref(), Some("Hallo Welt."));
        assert!(outcome.issues.is_empty());

        let seen = api.seen.lock().unwrap();
        assert!(seen[1].system_prompt.contains("initial capitalization differs"));
        assert!(seen[1].system_prompt.contains("ending punctuation presence differs"));
    }

    #[tokio::test]
    async fn open_warnings_are_returned_when_budget_runs_out() {
        let api = Scripted::new(vec![Ok(vec!["hallo Welt"]), Ok(vec!["hallo Welt"]), Ok(vec!["hallo Welt"])]);
        let (outcome, _) = run(api.clone(), task("Hello world.", OperationType::Translation, 2, false), false).await;
        assert_eq!(api.calls(), 3);
        assert_eq!(outcome.text.as_deref(), Some("hallo Welt"));
        let mut kinds: Vec<IssueKind> = outcome.issues.iter().map(|i| i.kind).collect();
        kinds.sort_by_key(|k| format!("{k:?}"));
        assert_eq!(kinds, vec![IssueKind::Capitalization, IssueKind::Punctuation]);
        assert!(outcome.issues.iter().all(|i| !i.is_error()));
    }

    #[tokio::test]
    async fn zero_repair_limit_makes_one_attempt() {
        let api = Scripted::new(vec![Ok(vec!["Hallo"]), Ok(vec!["unused"])]);
        let (outcome, _) = run(api.clone(), task("Hello {name}", OperationType::Translation, 0, false), false).await;
        assert_eq!(api.calls(), 1);
        assert_eq!(outcome.text.as_deref(), Some("Hallo"));
        assert!(!outcome.issues.is_empty());
    }

    #[tokio::test]
    async fn fix_sends_raw_text_once() {
        let api = Scripted::new(vec![Ok(vec!["Hallo"])]);
        let (outcome, _) = run(api.clone(), task("Hello {name}", OperationType::Fix, 3, false), false).await;
        assert_eq!(api.calls(), 1);
        assert_eq!(outcome.text.as_deref(), Some("Hallo"));
        assert!(outcome.issues.is_empty());
        assert_eq!(api.seen.lock().unwrap()[0].user_text, "Hello {name}");
    }

    #[tokio::test]
    async fn api_failure_aborts_without_repair() {
        let api = Scripted::new(vec![Ok(vec!["Hallo"]), Err(()), Ok(vec!["Hallo {name}"])]);
        let (outcome, events) = run(api.clone(), task("Hello {name}", OperationType::Translation, 3, false), false).await;
        assert_eq!(api.calls(), 2);
        assert!(outcome.text.is_none());
        assert!(outcome.error.as_deref().unwrap_or_default().contains("503"));
        assert!(events
            .iter()
            .any(|e| matches!(e, WorkerEvent::Log { level: LogLevel::Error, .. })));
    }

    #[tokio::test]
    async fn unmarked_cot_response_falls_back_to_literal_text() {
        let api = Scripted::new(vec![Ok(vec!["Guten ", "Morgen"])]);
        let (outcome, events) = run(api, task("Good morning", OperationType::Translation, 0, true), true).await;
        assert_eq!(outcome.text.as_deref(), Some("Guten Morgen"));
        assert_eq!(fragments(&events), "Guten Morgen");
    }

    #[tokio::test]
    async fn whitespace_only_source_is_returned_untouched() {
        let api = Scripted::new(vec![]);
        let (outcome, _) = run(api.clone(), task(" \n ", OperationType::Translation, 1, true), false).await;
        assert_eq!(api.calls(), 0);
        assert_eq!(outcome.text.as_deref(), Some(" \n "));
        assert_eq!(outcome.attempts, 0);
    }

    struct Stalled;

    #[async_trait]
    impl CompletionApi for Stalled {
        async fn complete(&self, _req: &CompletionRequest) -> Result<String, ApiError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".into())
        }
    }

    #[tokio::test]
    async fn slow_api_times_out_as_task_error() {
        let mut t = task("Hello", OperationType::Translation, 2, false);
        t.timeout = Duration::from_millis(20);
        let outcome = TranslationWorker::new(t, ContextSnapshot::default(), Arc::new(Services::new(Arc::new(Stalled))))
            .run(None)
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("timed out"));
    }
}
