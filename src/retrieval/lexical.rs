use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use super::{rank, CancelFn, CorpusItem, ProgressFn, RetrievalBackend, RetrievalResult};

const MIN_N: usize = 2;
const MAX_N: usize = 4;

struct LexicalIndex {
    items: Vec<CorpusItem>,
    vocab: HashMap<String, usize>,
    idf: Vec<f32>,
    /// term id -> (doc id, normalized weight)
    postings: Vec<Vec<(usize, f32)>>,
}

/// Character n-gram TF-IDF with cosine similarity.
pub struct LexicalBackend {
    index: RwLock<Option<LexicalIndex>>,
}

impl Default for LexicalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LexicalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: RwLock::new(None),
        }
    }
}

/// Word-bounded character n-grams: each whitespace-separated word is padded with one space on
/// each side and cut into 2..=4-grams. A padded word no longer than `n` is emitted whole once and
/// ends the larger sizes for that word.
#[must_use]
pub fn char_wb_ngrams(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut out = Vec::new();
    for word in lowered.split_whitespace() {
        let padded: Vec<char> = std::iter::once(' ')
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();
        for n in MIN_N..=MAX_N {
            if padded.len() <= n {
                out.push(padded.iter().collect());
                break;
            }
            for w in padded.windows(n) {
                out.push(w.iter().collect());
            }
        }
    }
    out
}

fn term_counts(text: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for g in char_wb_ngrams(text) {
        *counts.entry(g).or_insert(0) += 1;
    }
    counts
}

fn weigh(counts: impl IntoIterator<Item = (usize, usize)>, idf: &[f32]) -> Vec<(usize, f32)> {
    let mut v: Vec<(usize, f32)> = counts
        .into_iter()
        .map(|(t, c)| (t, c as f32 * idf[t]))
        .collect();
    let norm = v.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
    if norm > 0.0 {
        for (_, w) in v.iter_mut() {
            *w /= norm;
        }
    }
    v
}

#[async_trait]
impl RetrievalBackend for LexicalBackend {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn build_index(
        &self,
        corpus: &[CorpusItem],
        progress: Option<ProgressFn<'_>>,
        cancel: Option<CancelFn<'_>>,
    ) -> bool {
        let items: Vec<CorpusItem> = corpus
            .iter()
            .filter(|c| !c.source.trim().is_empty())
            .cloned()
            .collect();
        if items.is_empty() {
            return false;
        }

        let mut vocab: HashMap<String, usize> = HashMap::new();
        let mut df: Vec<usize> = Vec::new();
        let mut doc_counts: Vec<Vec<(usize, usize)>> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if i % 256 == 0 {
                if cancel.is_some_and(|c| c()) {
                    debug!("lexical index build cancelled");
                    return false;
                }
                if let Some(cb) = progress {
                    cb((i * 100 / items.len()) as u8);
                }
            }
            let mut counts = Vec::new();
            for (gram, c) in term_counts(&item.source) {
                let next_id = vocab.len();
                let id = *vocab.entry(gram).or_insert(next_id);
                if id == df.len() {
                    df.push(0);
                }
                df[id] += 1;
                counts.push((id, c));
            }
            doc_counts.push(counts);
        }

        let n_docs = items.len() as f32;
        let idf: Vec<f32> = df
            .iter()
            .map(|&d| ((1.0 + n_docs) / (1.0 + d as f32)).ln() + 1.0)
            .collect();
        let mut postings: Vec<Vec<(usize, f32)>> = vec![Vec::new(); vocab.len()];
        for (doc, counts) in doc_counts.into_iter().enumerate() {
            for (t, w) in weigh(counts, &idf) {
                postings[t].push((doc, w));
            }
        }

        if let Some(cb) = progress {
            cb(100);
        }
        debug!(docs = items.len(), terms = vocab.len(), "lexical index ready");
        let index = LexicalIndex {
            items,
            vocab,
            idf,
            postings,
        };
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = Some(index);
        true
    }

    async fn retrieve(&self, query: &str, limit: usize, threshold: f32) -> Vec<RetrievalResult> {
        let guard = self.index.read().unwrap_or_else(|e| e.into_inner());
        let Some(index) = guard.as_ref() else {
            return Vec::new();
        };
        if limit == 0 || query.trim().is_empty() {
            return Vec::new();
        }

        let known: Vec<(usize, usize)> = term_counts(query)
            .into_iter()
            .filter_map(|(g, c)| index.vocab.get(&g).map(|&id| (id, c)))
            .collect();
        let mut scores = vec![0.0f32; index.items.len()];
        for (t, qw) in weigh(known, &index.idf) {
            for &(doc, dw) in &index.postings[t] {
                scores[doc] += qw * dw;
            }
        }

        rank(scores.into_iter().enumerate(), limit, threshold)
            .into_iter()
            .map(|(doc, score)| RetrievalResult {
                source_text: index.items[doc].source.clone(),
                target_text: index.items[doc].target.clone(),
                score,
            })
            .collect()
    }

    fn clear(&self) {
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn indexed_len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, |i| i.items.len())
    }
}
