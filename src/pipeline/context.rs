//! Per-task context: neighbor strings, glossary hits, similar translations and provider extras.
//!
//! A [`ContextSnapshot`] is built fresh for every task from the project state at that moment and
//! is read-only afterwards. The dispatcher obtains snapshots through [`ContextSource`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pipeline::prompts::Placeholders;
use crate::quality::placeholder_spans;
use crate::retrieval::{RetrievalCore, RetrievalMode, RetrievalResult};
use crate::terminology::{render_glossary_table, Glossary, GlossaryMatch};

/// One unit of work handed to the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchItem {
    pub id: String,
    pub source_text: String,
    pub target_language: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ContextSnapshot {
    pub neighbor_original_text: String,
    pub neighbor_translated_pairs: String,
    pub glossary_matches: Vec<GlossaryMatch>,
    pub retrieval_matches: Vec<RetrievalResult>,
    pub style_guide_text: String,
    /// Placeholder values contributed by [`ContextProvider`]s.
    pub extra: Placeholders,
}

impl ContextSnapshot {
    /// Prompt placeholder values. Source and target language are added by the worker.
    #[must_use]
    pub fn placeholders(&self) -> Placeholders {
        let mut out = Placeholders::new();
        out.insert(
            "Untranslated Context".into(),
            self.neighbor_original_text.clone(),
        );
        out.insert(
            "Translated Context".into(),
            self.neighbor_translated_pairs.clone(),
        );
        out.insert(
            "Glossary".into(),
            render_glossary_table(&self.glossary_matches),
        );
        out.insert(
            "Semantic Context".into(),
            render_similar(&self.retrieval_matches),
        );
        out.insert("Style Guide".into(), self.style_guide_text.trim().to_string());
        for (k, v) in &self.extra {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}

fn render_similar(matches: &[RetrievalResult]) -> String {
    if matches.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = matches
        .iter()
        .map(|r| format!("- Source: {}\n  Target: {}", r.source_text, r.target_text))
        .collect();
    format!("Similar Translations:\n{}", lines.join("\n"))
}

/// A project string as loaded from the items file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProjectEntry {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub ignored: bool,
}

impl ProjectEntry {
    fn translated(&self) -> Option<&str> {
        self.translation.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// Ordered project strings. Translations fill in while a batch runs, so later tasks see the
/// results of earlier ones as neighbor context.
pub struct ProjectMemory {
    entries: RwLock<Vec<ProjectEntry>>,
    positions: HashMap<String, usize>,
}

impl ProjectMemory {
    #[must_use]
    pub fn new(entries: Vec<ProjectEntry>) -> Self {
        let mut positions = HashMap::with_capacity(entries.len());
        for (i, e) in entries.iter().enumerate() {
            positions.entry(e.id.clone()).or_insert(i);
        }
        Self {
            entries: RwLock::new(entries),
            positions,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Stores a finished translation. Returns false for an unknown id.
    pub fn record_translation(&self, id: &str, text: &str) -> bool {
        let Some(&pos) = self.positions.get(id) else {
            return false;
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries[pos].translation = Some(text.to_string());
        true
    }

    #[must_use]
    pub fn translation(&self, id: &str) -> Option<String> {
        let pos = *self.positions.get(id)?;
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries[pos].translation.clone()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<ProjectEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Up to `max` non-ignored source strings on each side of `id` as `- "text"` lines.
    /// `max == 0` means no limit.
    #[must_use]
    pub fn neighbor_original_text(&self, id: &str, max: usize) -> String {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let Some(&pos) = self.positions.get(id) else {
            return String::new();
        };
        let picked = around(&entries, pos, max, |e| !e.ignored);
        picked
            .iter()
            .map(|e| format!("- \"{}\"", e.source.replace('\n', " ").trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Up to `max` already translated, non-ignored neighbors on each side of `id` as a markdown
    /// table. `max == 0` means no limit.
    #[must_use]
    pub fn neighbor_translated_pairs(&self, id: &str, max: usize) -> String {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let Some(&pos) = self.positions.get(id) else {
            return String::new();
        };
        let picked = around(&entries, pos, max, |e| !e.ignored && e.translated().is_some());
        if picked.is_empty() {
            return String::new();
        }
        let mut out = String::from("| Original | Translation |\n|---|---|");
        for e in picked {
            out.push_str(&format!(
                "\n| {} | {} |",
                table_cell(&e.source),
                table_cell(e.translated().unwrap_or_default())
            ));
        }
        out
    }
}

fn around<'a>(
    entries: &'a [ProjectEntry],
    pos: usize,
    max: usize,
    keep: impl Fn(&ProjectEntry) -> bool,
) -> Vec<&'a ProjectEntry> {
    let limit = if max == 0 { usize::MAX } else { max };
    let mut before: Vec<&ProjectEntry> = entries[..pos]
        .iter()
        .rev()
        .filter(|e| keep(e))
        .take(limit)
        .collect();
    before.reverse();
    let after = entries[pos + 1..].iter().filter(|e| keep(e)).take(limit);
    before.extend(after);
    before
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Optional context enrichment. Returns extra placeholder values for one item.
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;

    fn provide(&self, item: &BatchItem, snapshot: &ContextSnapshot) -> anyhow::Result<Placeholders>;
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ContextProvider>>,
}

impl ProviderRegistry {
    pub fn register(&mut self, provider: Arc<dyn ContextProvider>) {
        self.providers.push(provider);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Merges every provider's values in registration order. A provider that errors or panics
    /// is logged and skipped.
    #[must_use]
    pub fn collect(&self, item: &BatchItem, snapshot: &ContextSnapshot) -> Placeholders {
        let mut out = Placeholders::new();
        for p in &self.providers {
            match catch_unwind(AssertUnwindSafe(|| p.provide(item, snapshot))) {
                Ok(Ok(values)) => out.extend(values),
                Ok(Err(e)) => warn!(provider = p.name(), item = %item.id, error = %e, "context provider failed"),
                Err(_) => warn!(provider = p.name(), item = %item.id, "context provider panicked"),
            }
        }
        out
    }
}

/// Where the dispatcher gets the context for each task.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn snapshot(&self, item: &BatchItem) -> ContextSnapshot;
}

#[async_trait]
impl<F> ContextSource for F
where
    F: Fn(&BatchItem) -> ContextSnapshot + Send + Sync,
{
    async fn snapshot(&self, item: &BatchItem) -> ContextSnapshot {
        self(item)
    }
}

/// Empty context for every item.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoContext;

#[async_trait]
impl ContextSource for NoContext {
    async fn snapshot(&self, _item: &BatchItem) -> ContextSnapshot {
        ContextSnapshot::default()
    }
}

#[derive(Clone, Debug)]
pub struct ContextOptions {
    pub neighbors: usize,
    pub style_guide: String,
    pub retrieval_mode: RetrievalMode,
    pub retrieval_limit: usize,
    pub retrieval_threshold: f32,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            neighbors: 3,
            style_guide: String::new(),
            retrieval_mode: RetrievalMode::Auto,
            retrieval_limit: 5,
            retrieval_threshold: 0.3,
        }
    }
}

pub struct ContextAssembler {
    glossary: Arc<Glossary>,
    memory: Arc<ProjectMemory>,
    retrieval: Option<Arc<RetrievalCore>>,
    providers: ProviderRegistry,
    options: ContextOptions,
}

impl ContextAssembler {
    #[must_use]
    pub fn new(glossary: Arc<Glossary>, memory: Arc<ProjectMemory>, options: ContextOptions) -> Self {
        Self {
            glossary,
            memory,
            retrieval: None,
            providers: ProviderRegistry::default(),
            options,
        }
    }

    #[must_use]
    pub fn with_retrieval(mut self, core: Arc<RetrievalCore>) -> Self {
        self.retrieval = Some(core);
        self
    }

    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn memory(&self) -> &Arc<ProjectMemory> {
        &self.memory
    }

    pub async fn assemble(&self, item: &BatchItem) -> ContextSnapshot {
        let text = &item.source_text;
        let n = self.options.neighbors;
        let glossary_matches = if self.glossary.is_empty() {
            Vec::new()
        } else {
            self.glossary.find(text, &placeholder_spans(text))
        };
        let retrieval_matches = match self.retrieval.as_ref() {
            Some(core) if self.options.retrieval_limit > 0 => {
                core.retrieve(
                    text,
                    self.options.retrieval_limit,
                    self.options.retrieval_threshold,
                    self.options.retrieval_mode,
                )
                .await
            }
            _ => Vec::new(),
        };

        let mut snapshot = ContextSnapshot {
            neighbor_original_text: self.memory.neighbor_original_text(&item.id, n),
            neighbor_translated_pairs: self.memory.neighbor_translated_pairs(&item.id, n),
            glossary_matches,
            retrieval_matches,
            style_guide_text: self.options.style_guide.clone(),
            extra: Placeholders::new(),
        };
        if !self.providers.is_empty() {
            snapshot.extra = self.providers.collect(item, &snapshot);
        }
        debug!(
            item = %item.id,
            glossary = snapshot.glossary_matches.len(),
            similar = snapshot.retrieval_matches.len(),
            extra = snapshot.extra.len(),
            "context assembled"
        );
        snapshot
    }
}

#[async_trait]
impl ContextSource for ContextAssembler {
    async fn snapshot(&self, item: &BatchItem) -> ContextSnapshot {
        self.assemble(item).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::CorpusItem;
    use crate::terminology::GlossaryEntry;

    fn entry(id: &str, source: &str, translation: Option<&str>, ignored: bool) -> ProjectEntry {
        ProjectEntry {
            id: id.into(),
            source: source.into(),
            translation: translation.map(str::to_string),
            ignored,
        }
    }

    fn memory() -> ProjectMemory {
        ProjectMemory::new(vec![
            entry("a", "File", Some("Datei"), false),
            entry("b", "Debug only", None, true),
            entry("c", "Edit\nmenu", None, false),
            entry("d", "Open {name}", None, false),
            entry("e", "Save | close", Some("Speichern | Schließen"), false),
            entry("f", "Quit", None, false),
        ])
    }

    fn item(id: &str, text: &str) -> BatchItem {
        BatchItem {
            id: id.into(),
            source_text: text.into(),
            target_language: "German".into(),
        }
    }

    #[test]
    fn original_neighbors_skip_ignored_entries() {
        let m = memory();
        assert_eq!(
            m.neighbor_original_text("d", 2),
            "- \"File\"\n- \"Edit menu\"\n- \"Save | close\"\n- \"Quit\""
        );
        assert_eq!(m.neighbor_original_text("d", 1), "- \"Edit menu\"\n- \"Save | close\"");
        assert_eq!(m.neighbor_original_text("zz", 3), "");
    }

    #[test]
    fn translated_pairs_grow_with_recorded_results() {
        let m = memory();
        assert_eq!(
            m.neighbor_translated_pairs("d", 3),
            "| Original | Translation |\n|---|---|\n| File | Datei |\n| Save \\| close | Speichern \\| Schließen |"
        );
        assert!(m.record_translation("c", "Bearbeiten"));
        assert!(!m.record_translation("zz", "x"));
        let table = m.neighbor_translated_pairs("d", 1);
        assert!(table.contains("| Edit menu | Bearbeiten |"));
        assert!(!table.contains("Datei"));
        assert_eq!(m.translation("c").as_deref(), Some("Bearbeiten"));
    }

    struct Fixed(&'static str, &'static str);

    impl ContextProvider for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn provide(&self, _item: &BatchItem, _s: &ContextSnapshot) -> anyhow::Result<Placeholders> {
            Ok(Placeholders::from([(self.0.to_string(), self.1.to_string())]))
        }
    }

    struct Broken;

    impl ContextProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn provide(&self, _item: &BatchItem, _s: &ContextSnapshot) -> anyhow::Result<Placeholders> {
            anyhow::bail!("backend offline")
        }
    }

    struct Panicky;

    impl ContextProvider for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn provide(&self, _item: &BatchItem, _s: &ContextSnapshot) -> anyhow::Result<Placeholders> {
            panic!("provider bug")
        }
    }

    #[test]
    fn failing_providers_do_not_block_others() {
        let mut reg = ProviderRegistry::default();
        reg.register(Arc::new(Broken));
        reg.register(Arc::new(Panicky));
        reg.register(Arc::new(Fixed("Custom Notes", "keep it short")));
        let extra = reg.collect(&item("a", "File"), &ContextSnapshot::default());
        assert_eq!(extra.get("Custom Notes").map(String::as_str), Some("keep it short"));
        assert_eq!(extra.len(), 1);
    }

    #[tokio::test]
    async fn assembler_combines_all_sources() {
        let glossary = Glossary::from_entries(
            vec![
                GlossaryEntry {
                    term: "open".into(),
                    translation: "öffnen".into(),
                },
                GlossaryEntry {
                    term: "name".into(),
                    translation: "Name".into(),
                },
            ],
            false,
        );
        let core = RetrievalCore::lexical_only();
        core.build_index(
            &[CorpusItem {
                source: "Open {file}".into(),
                target: "{file} öffnen".into(),
            }],
            None,
            None,
        )
        .await;
        let mut providers = ProviderRegistry::default();
        providers.register(Arc::new(Fixed("Custom Notes", "UI strings")));

        let assembler = ContextAssembler::new(
            Arc::new(glossary),
            Arc::new(memory()),
            ContextOptions {
                style_guide: "Use the formal Sie.".into(),
                retrieval_threshold: 0.1,
                ..ContextOptions::default()
            },
        )
        .with_retrieval(Arc::new(core))
        .with_providers(providers);

        let snap = assembler.snapshot(&item("d", "Open {name}")).await;
        let terms: Vec<&str> = snap.glossary_matches.iter().map(|m| m.term.as_str()).collect();
        assert_eq!(terms, vec!["Open"]);
        assert_eq!(snap.retrieval_matches.len(), 1);

        let values = snap.placeholders();
        assert!(values["Glossary"].contains("| Open | öffnen |"));
        assert!(values["Semantic Context"].starts_with("Similar Translations:\n- Source: Open {file}\n  Target: {file} öffnen"));
        assert_eq!(values["Style Guide"], "Use the formal Sie.");
        assert_eq!(values["Custom Notes"], "UI strings");
        assert!(values["Untranslated Context"].contains("- \"Quit\""));
    }

    #[tokio::test]
    async fn closures_and_no_context_are_sources() {
        let empty = NoContext.snapshot(&item("x", "y")).await;
        assert!(empty.placeholders().values().all(|v| v.is_empty()));

        let styled = |_: &BatchItem| ContextSnapshot {
            style_guide_text: "terse".into(),
            ..ContextSnapshot::default()
        };
        assert_eq!(styled.snapshot(&item("x", "y")).await.style_guide_text, "terse");
    }
}
