//! Similar-text retrieval over a translation memory corpus.
//!
//! Two backends share one interface: a character n-gram TF-IDF index that always works and a
//! dense-vector index backed by an embedding model and the persistent [`EmbeddingCache`].
//! [`RetrievalCore`] picks between them.

mod cache;
mod dense;
mod lexical;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use cache::EmbeddingCache;
pub use dense::DenseBackend;
pub use lexical::{char_wb_ngrams, LexicalBackend};

/// One translation memory pair.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CorpusItem {
    pub source: String,
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub source_text: String,
    pub target_text: String,
    /// Similarity in `[0, 1]`.
    pub score: f32,
}

/// Receives build progress in percent.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);
/// Returns true once the caller wants the build abandoned.
pub type CancelFn<'a> = &'a (dyn Fn() -> bool + Send + Sync);

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    /// Replaces the index with one built from `corpus`. Returns false when nothing usable was
    /// indexed or the build was cancelled; the previous index is kept in that case.
    async fn build_index(
        &self,
        corpus: &[CorpusItem],
        progress: Option<ProgressFn<'_>>,
        cancel: Option<CancelFn<'_>>,
    ) -> bool;

    /// Top `limit` matches scoring at least `threshold`, best first.
    async fn retrieve(&self, query: &str, limit: usize, threshold: f32) -> Vec<RetrievalResult>;

    fn clear(&self);

    fn indexed_len(&self) -> usize;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Auto,
    Lexical,
    Dense,
}

impl RetrievalMode {
    pub fn parse(s: Option<&str>) -> Self {
        match s.unwrap_or("auto").trim().to_ascii_lowercase().as_str() {
            "lexical" | "tfidf" => Self::Lexical,
            "dense" | "vector" | "onnx" => Self::Dense,
            _ => Self::Auto,
        }
    }
}

/// Backend selection: dense when it is usable, lexical otherwise. Forced modes never substitute
/// one backend for the other.
pub struct RetrievalCore {
    lexical: LexicalBackend,
    dense: Option<DenseBackend>,
}

impl RetrievalCore {
    #[must_use]
    pub fn new(lexical: LexicalBackend, dense: Option<DenseBackend>) -> Self {
        Self { lexical, dense }
    }

    #[must_use]
    pub fn lexical_only() -> Self {
        Self::new(LexicalBackend::new(), None)
    }

    /// Indexes `corpus` in the lexical backend and, when available, the dense one. Returns true
    /// if at least one backend ended up with a usable index.
    pub async fn build_index(
        &self,
        corpus: &[CorpusItem],
        progress: Option<ProgressFn<'_>>,
        cancel: Option<CancelFn<'_>>,
    ) -> bool {
        let lexical_ok = self.lexical.build_index(corpus, None, cancel).await;
        let mut dense_ok = false;
        if let Some(dense) = self.dense.as_ref().filter(|d| d.is_available()) {
            dense_ok = dense.build_index(corpus, progress, cancel).await;
            if !dense_ok {
                warn!("dense index build failed; lexical retrieval stays in use");
            }
        }
        if let Some(cb) = progress {
            cb(100);
        }
        info!(
            items = corpus.len(),
            lexical = lexical_ok,
            dense = dense_ok,
            "retrieval index built"
        );
        lexical_ok || dense_ok
    }

    /// Backend that serves `mode`, or None if a forced backend cannot serve.
    #[must_use]
    pub fn backend_for(&self, mode: RetrievalMode) -> Option<&dyn RetrievalBackend> {
        let dense_ready = self
            .dense
            .as_ref()
            .filter(|d| d.is_available() && d.indexed_len() > 0);
        match mode {
            RetrievalMode::Auto => match dense_ready {
                Some(d) => Some(d as &dyn RetrievalBackend),
                None => Some(&self.lexical as &dyn RetrievalBackend),
            },
            RetrievalMode::Lexical => Some(&self.lexical as &dyn RetrievalBackend),
            RetrievalMode::Dense => self
                .dense
                .as_ref()
                .filter(|d| d.is_available())
                .map(|d| d as &dyn RetrievalBackend),
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
        mode: RetrievalMode,
    ) -> Vec<RetrievalResult> {
        match self.backend_for(mode) {
            Some(backend) => backend.retrieve(query, limit, threshold).await,
            None => {
                warn!(?mode, "requested retrieval backend unavailable; returning no matches");
                Vec::new()
            }
        }
    }

    pub fn clear(&self) {
        self.lexical.clear();
        if let Some(d) = self.dense.as_ref() {
            d.clear();
        }
    }
}

/// Keeps positive scores at or above `threshold`, best first, at most `limit`. Ties keep corpus
/// order.
pub(crate) fn rank(scores: impl IntoIterator<Item = (usize, f32)>, limit: usize, threshold: f32) -> Vec<(usize, f32)> {
    let mut kept: Vec<(usize, f32)> = scores
        .into_iter()
        .filter(|&(_, s)| s > 0.0 && s >= threshold)
        .map(|(i, s)| (i, s.min(1.0)))
        .collect();
    kept.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
    kept.truncate(limit);
    kept
}

pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_filters_sorts_and_limits() {
        let ranked = rank(vec![(0, 0.2), (1, 0.9), (2, 0.0), (3, 0.5), (4, 0.9)], 3, 0.3);
        assert_eq!(ranked, vec![(1, 0.9), (4, 0.9), (3, 0.5)]);
        assert!(rank(vec![(0, 0.0)], 5, 0.0).is_empty());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(RetrievalMode::parse(None), RetrievalMode::Auto);
        assert_eq!(RetrievalMode::parse(Some("TFIDF")), RetrievalMode::Lexical);
        assert_eq!(RetrievalMode::parse(Some("dense")), RetrievalMode::Dense);
    }

    #[tokio::test]
    async fn forced_dense_fails_closed_without_a_model() {
        let core = RetrievalCore::lexical_only();
        let corpus = vec![CorpusItem {
            source: "open the file".into(),
            target: "Datei öffnen".into(),
        }];
        assert!(core.build_index(&corpus, None, None).await);

        assert!(core
            .retrieve("open the file", 5, 0.1, RetrievalMode::Dense)
            .await
            .is_empty());
        let auto = core.retrieve("open the file", 5, 0.1, RetrievalMode::Auto).await;
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].target_text, "Datei öffnen");
    }
}
