use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{
    l2_normalize, rank, CancelFn, CorpusItem, EmbeddingCache, ProgressFn, RetrievalBackend,
    RetrievalResult,
};
use crate::error::RetrievalError;
use crate::models::EmbeddingModel;

const DEFAULT_BATCH_SIZE: usize = 32;
const PROBE_TEXT: &str = "dimension probe";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Activation {
    Pending,
    Ready(usize),
    Failed,
}

struct DenseState {
    activation: Activation,
    items: Vec<CorpusItem>,
    vectors: Vec<Vec<f32>>,
}

/// Embedding-model retrieval with dot-product ranking over normalized vectors.
pub struct DenseBackend {
    model: Arc<dyn EmbeddingModel>,
    cache: Option<Arc<EmbeddingCache>>,
    batch_size: usize,
    state: RwLock<DenseState>,
}

impl DenseBackend {
    pub fn new(model: Arc<dyn EmbeddingModel>, cache: Option<Arc<EmbeddingCache>>) -> Self {
        Self {
            model,
            cache,
            batch_size: DEFAULT_BATCH_SIZE,
            state: RwLock::new(DenseState {
                activation: Activation::Pending,
                items: Vec::new(),
                vectors: Vec::new(),
            }),
        }
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    fn activation(&self) -> Activation {
        self.state.read().unwrap_or_else(|e| e.into_inner()).activation
    }

    fn set_activation(&self, a: Activation) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).activation = a;
    }

    /// Probes the model's output dimension once and checks it against the dimension recorded for
    /// this model id (or the model's declared dimension). A mismatch disables the backend.
    pub async fn activate(&self) -> Result<usize, RetrievalError> {
        match self.activation() {
            Activation::Ready(dim) => return Ok(dim),
            Activation::Failed => {
                return Err(RetrievalError::Unavailable(format!(
                    "embedding model {} failed activation",
                    self.model_id()
                )))
            }
            Activation::Pending => {}
        }

        let probe = self.model.embed(&[PROBE_TEXT.to_string()]).await?;
        let actual = probe.first().map_or(0, Vec::len);
        let recorded = match self.cache.as_ref() {
            Some(cache) => cache.recorded_dim(self.model_id()).unwrap_or_else(|e| {
                warn!(error = %e, "could not read recorded embedding dimension");
                None
            }),
            None => None,
        };
        let expected = recorded.or_else(|| self.model.expected_dim());

        if actual == 0 || expected.is_some_and(|e| e != actual) {
            self.set_activation(Activation::Failed);
            let err = RetrievalError::ModelMismatch {
                model_id: self.model_id().to_string(),
                expected: expected.unwrap_or(0),
                actual,
            };
            error!(error = %err, "embedding model activation aborted");
            return Err(err);
        }

        if let Some(cache) = self.cache.as_ref() {
            if let Err(e) = cache.record_dim(self.model_id(), actual) {
                warn!(error = %e, "could not record embedding dimension");
            }
        }
        self.set_activation(Activation::Ready(actual));
        info!(model_id = self.model_id(), dim = actual, "embedding model activated");
        Ok(actual)
    }

    async fn cache_lookup(&self, texts: Vec<String>) -> HashMap<String, Vec<f32>> {
        let Some(cache) = self.cache.clone() else {
            return HashMap::new();
        };
        let model_id = self.model_id().to_string();
        match tokio::task::spawn_blocking(move || cache.get_vectors(&texts, &model_id)).await {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "embedding cache lookup task failed");
                HashMap::new()
            }
        }
    }

    async fn cache_store(&self, vectors: HashMap<String, Vec<f32>>) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let model_id = self.model_id().to_string();
        match tokio::task::spawn_blocking(move || cache.save_vectors(&vectors, &model_id)).await {
            Ok(n) => debug!(inserted = n, "embedding cache updated"),
            Err(e) => error!(error = %e, "embedding cache write task failed"),
        }
    }

    async fn embed_normalized(&self, texts: &[String], dim: usize) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let mut vectors = self.model.embed(texts).await?;
        for v in vectors.iter_mut() {
            if v.len() != dim {
                self.set_activation(Activation::Failed);
                return Err(RetrievalError::ModelMismatch {
                    model_id: self.model_id().to_string(),
                    expected: dim,
                    actual: v.len(),
                });
            }
            l2_normalize(v);
        }
        Ok(vectors)
    }

    async fn try_build(
        &self,
        corpus: &[CorpusItem],
        progress: Option<ProgressFn<'_>>,
        cancel: Option<CancelFn<'_>>,
    ) -> Result<bool, RetrievalError> {
        let dim = self.activate().await?;
        let items: Vec<CorpusItem> = corpus
            .iter()
            .filter(|c| !c.source.trim().is_empty())
            .cloned()
            .collect();
        if items.is_empty() {
            return Ok(false);
        }

        let sources: Vec<String> = items.iter().map(|c| c.source.clone()).collect();
        let mut known = self.cache_lookup(sources.clone()).await;
        known.retain(|_, v| v.len() == dim);

        let mut queued: HashSet<&String> = HashSet::new();
        let missing: Vec<String> = sources
            .iter()
            .filter(|s| !known.contains_key(*s) && queued.insert(*s))
            .cloned()
            .collect();
        debug!(total = sources.len(), cached = sources.len() - missing.len(), "dense index cache check");

        let mut fresh: HashMap<String, Vec<f32>> = HashMap::new();
        let batches = missing.len().div_ceil(self.batch_size).max(1);
        for (b, batch) in missing.chunks(self.batch_size).enumerate() {
            if cancel.is_some_and(|c| c()) {
                info!("dense index build cancelled");
                self.cache_store(fresh).await;
                return Ok(false);
            }
            let vectors = self.embed_normalized(batch, dim).await?;
            for (text, v) in batch.iter().zip(vectors) {
                fresh.insert(text.clone(), v);
            }
            if let Some(cb) = progress {
                cb(((b + 1) * 100 / batches).min(99) as u8);
            }
        }

        let mut vectors = Vec::with_capacity(items.len());
        for s in &sources {
            match known.get(s).or_else(|| fresh.get(s)) {
                Some(v) => vectors.push(v.clone()),
                None => {
                    return Err(RetrievalError::Unavailable(format!(
                        "no vector computed for corpus entry {s:?}"
                    )))
                }
            }
        }
        self.cache_store(fresh).await;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.items = items;
        state.vectors = vectors;
        Ok(true)
    }

    async fn try_retrieve(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let Activation::Ready(dim) = self.activation() else {
            return Ok(Vec::new());
        };
        if limit == 0 || query.trim().is_empty() || self.indexed_len() == 0 {
            return Ok(Vec::new());
        }
        let q = self
            .embed_normalized(&[query.to_string()], dim)
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let scores = state
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, v.iter().zip(&q).map(|(a, b)| a * b).sum::<f32>()));
        Ok(rank(scores, limit, threshold)
            .into_iter()
            .map(|(i, score)| RetrievalResult {
                source_text: state.items[i].source.clone(),
                target_text: state.items[i].target.clone(),
                score,
            })
            .collect())
    }
}

#[async_trait]
impl RetrievalBackend for DenseBackend {
    fn name(&self) -> &'static str {
        "dense"
    }

    fn is_available(&self) -> bool {
        self.activation() != Activation::Failed
    }

    async fn build_index(
        &self,
        corpus: &[CorpusItem],
        progress: Option<ProgressFn<'_>>,
        cancel: Option<CancelFn<'_>>,
    ) -> bool {
        match self.try_build(corpus, progress, cancel).await {
            Ok(built) => built,
            Err(e) => {
                error!(model_id = self.model_id(), error = %e, "dense index build failed");
                false
            }
        }
    }

    async fn retrieve(&self, query: &str, limit: usize, threshold: f32) -> Vec<RetrievalResult> {
        match self.try_retrieve(query, limit, threshold).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(model_id = self.model_id(), error = %e, "dense retrieval failed");
                Vec::new()
            }
        }
    }

    fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.items.clear();
        state.vectors.clear();
    }

    fn indexed_len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::retrieval::{RetrievalCore, RetrievalMode, LexicalBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bag-of-letters embedding: one axis per letter a..=h.
    struct LetterModel {
        id: &'static str,
        dim: usize,
        calls: AtomicUsize,
        embedded: AtomicUsize,
    }

    impl LetterModel {
        fn new(id: &'static str, dim: usize) -> Self {
            Self {
                id,
                dim,
                calls: AtomicUsize::new(0),
                embedded: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingModel for LetterModel {
        fn model_id(&self) -> &str {
            self.id
        }

        fn expected_dim(&self) -> Option<usize> {
            None
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dim];
                    for ch in t.chars() {
                        let idx = (ch as usize).wrapping_sub('a' as usize);
                        if idx < self.dim {
                            v[idx] += 1.0;
                        }
                    }
                    v[0] += 0.01;
                    v
                })
                .collect())
        }
    }

    fn corpus() -> Vec<CorpusItem> {
        ["aaa", "bbb", "abab", "hhh"]
            .iter()
            .map(|s| CorpusItem {
                source: s.to_string(),
                target: s.to_uppercase(),
            })
            .collect()
    }

    #[tokio::test]
    async fn builds_from_cache_on_second_run() {
        let cache = Arc::new(EmbeddingCache::open_in_memory().unwrap());
        let first = Arc::new(LetterModel::new("letters", 8));
        let backend = DenseBackend::new(first.clone(), Some(cache.clone()));
        assert!(backend.build_index(&corpus(), None, None).await);
        assert_eq!(first.embedded.load(Ordering::SeqCst), 1 + 4);
        assert_eq!(cache.count("letters").unwrap(), 4);

        let second = Arc::new(LetterModel::new("letters", 8));
        let backend = DenseBackend::new(second.clone(), Some(cache));
        assert!(backend.build_index(&corpus(), None, None).await);
        assert_eq!(second.embedded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retrieves_by_dot_product() {
        let backend = DenseBackend::new(Arc::new(LetterModel::new("letters", 8)), None);
        backend.build_index(&corpus(), None, None).await;
        let hits = backend.retrieve("aa", 2, 0.5).await;
        assert_eq!(hits[0].source_text, "aaa");
        assert!(hits[0].score > 0.99 && hits[0].score <= 1.0);
        assert!(hits.iter().all(|h| h.source_text != "hhh"));
    }

    #[tokio::test]
    async fn dimension_mismatch_aborts_activation() {
        let cache = Arc::new(EmbeddingCache::open_in_memory().unwrap());
        cache.record_dim("letters", 16).unwrap();
        let backend = DenseBackend::new(Arc::new(LetterModel::new("letters", 8)), Some(cache));
        assert!(matches!(
            backend.activate().await,
            Err(RetrievalError::ModelMismatch { expected: 16, actual: 8, .. })
        ));
        assert!(!backend.is_available());
        assert!(!backend.build_index(&corpus(), None, None).await);
    }

    #[tokio::test]
    async fn core_falls_back_to_lexical_after_mismatch() {
        let cache = Arc::new(EmbeddingCache::open_in_memory().unwrap());
        cache.record_dim("letters", 16).unwrap();
        let dense = DenseBackend::new(Arc::new(LetterModel::new("letters", 8)), Some(cache));
        let core = RetrievalCore::new(LexicalBackend::new(), Some(dense));
        assert!(core.build_index(&corpus(), None, None).await);
        assert_eq!(core.backend_for(RetrievalMode::Auto).map(|b| b.name()), Some("lexical"));
        assert!(core.backend_for(RetrievalMode::Dense).is_none());
    }

    #[tokio::test]
    async fn cancel_stops_before_embedding() {
        let model = Arc::new(LetterModel::new("letters", 8));
        let backend = DenseBackend::new(model.clone(), None).with_batch_size(1);
        let cancel: CancelFn<'_> = &|| true;
        assert!(!backend.build_index(&corpus(), None, Some(cancel)).await);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.indexed_len(), 0);
    }
}
