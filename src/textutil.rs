use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Source text with its outer whitespace split off.
///
/// Remote models do not reliably keep incidental leading/trailing whitespace, so the core is sent
/// alone and the recorded edges are re-applied to whatever comes back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OuterWhitespace<'a> {
    pub leading: &'a str,
    pub core: &'a str,
    pub trailing: &'a str,
}

impl<'a> OuterWhitespace<'a> {
    #[must_use]
    pub fn split(text: &'a str) -> Self {
        let start_trimmed = text.trim_start();
        let leading = &text[..text.len() - start_trimmed.len()];
        let core = start_trimmed.trim_end();
        let trailing = &start_trimmed[core.len()..];
        Self {
            leading,
            core,
            trailing,
        }
    }

    #[must_use]
    pub fn reapply(&self, translated: &str) -> String {
        let body = translated.trim();
        let mut out = String::with_capacity(self.leading.len() + body.len() + self.trailing.len());
        out.push_str(self.leading);
        out.push_str(body);
        out.push_str(self.trailing);
        out
    }
}

#[must_use]
pub fn normalize_for_match(text: &str) -> String {
    let t = text.trim();
    WS_RE.replace_all(t, " ").to_string()
}

#[must_use]
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Content-addressed key for cached embeddings.
#[must_use]
pub fn content_hash(text: &str) -> String {
    sha256_hex(&normalize_for_match(text))
}

#[must_use]
pub fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Shortens `text` to at most `max_chars` characters for log lines.
#[must_use]
pub fn clip_for_log(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out.replace('\n', "\\n")
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}
