use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::textutil::is_word_char;

struct TrieNode<T> {
    children: HashMap<char, TrieNode<T>>,
    keyword: Option<(String, T)>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            keyword: None,
        }
    }
}

/// One keyword occurrence. `start`/`end` are byte offsets into the scanned text.
#[derive(Debug, PartialEq)]
pub struct KeywordMatch<'a, T> {
    /// The matched slice of the scanned text.
    pub term: &'a str,
    /// The keyword as it was inserted.
    pub keyword: &'a str,
    pub payload: &'a T,
    pub start: usize,
    pub end: usize,
}

/// Multi-pattern longest-match keyword matcher.
///
/// Scans left to right; at each position the longest keyword wins if it ends on a word boundary,
/// and scanning resumes at its end, so matches never overlap. A longest keyword that breaks the
/// boundary rejects the position outright; shorter keywords are not tried. Case folding happens per character on
/// both insertion and lookup, which keeps reported offsets valid for the original text.
pub struct KeywordTrie<T> {
    root: TrieNode<T>,
    case_sensitive: bool,
    len: usize,
}

impl<T> KeywordTrie<T> {
    #[must_use]
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            root: TrieNode::default(),
            case_sensitive,
            len: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Inserts `term`, replacing the payload of an existing identical keyword.
    /// Returns false for blank terms, which are never stored.
    pub fn add_keyword(&mut self, term: &str, payload: T) -> bool {
        if term.trim().is_empty() {
            return false;
        }
        let mut node = &mut self.root;
        for ch in term.chars() {
            if self.case_sensitive {
                node = node.children.entry(ch).or_default();
            } else {
                for lc in ch.to_lowercase() {
                    node = node.children.entry(lc).or_default();
                }
            }
        }
        if node.keyword.is_none() {
            self.len += 1;
        }
        node.keyword = Some((term.to_string(), payload));
        true
    }

    #[must_use]
    pub fn extract_keywords<'a>(&'a self, text: &'a str) -> Vec<KeywordMatch<'a, T>> {
        let mut out = Vec::new();
        if self.len == 0 || text.is_empty() {
            return out;
        }
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let byte_at = |idx: usize| chars.get(idx).map_or(text.len(), |&(b, _)| b);

        let mut i = 0usize;
        while i < chars.len() {
            match self.longest_at(&chars, i) {
                Some((end, (keyword, payload))) => {
                    let (start, end_byte) = (byte_at(i), byte_at(end));
                    out.push(KeywordMatch {
                        term: &text[start..end_byte],
                        keyword: keyword.as_str(),
                        payload,
                        start,
                        end: end_byte,
                    });
                    i = end;
                }
                None => i += 1,
            }
        }
        out
    }

    /// Walks the trie from char index `start` to the longest complete keyword. Returns its exclusive
    /// char end and entry, or None if the character after it is a word character.
    fn longest_at<'a>(
        &'a self,
        chars: &[(usize, char)],
        start: usize,
    ) -> Option<(usize, &'a (String, T))> {
        let mut node = &self.root;
        let mut best = None;
        let mut j = start;
        'walk: while j < chars.len() {
            let ch = chars[j].1;
            if self.case_sensitive {
                match node.children.get(&ch) {
                    Some(next) => node = next,
                    None => break,
                }
            } else {
                for lc in ch.to_lowercase() {
                    match node.children.get(&lc) {
                        Some(next) => node = next,
                        None => break 'walk,
                    }
                }
            }
            j += 1;
            if let Some(kw) = node.keyword.as_ref() {
                best = Some((j, kw));
            }
        }
        let (end, kw) = best?;
        let boundary_ok = chars.get(end).map_or(true, |&(_, c)| !is_word_char(c));
        boundary_ok.then_some((end, kw))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GlossaryEntry {
    pub term: String,
    pub translation: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GlossaryMatch {
    pub term: String,
    pub translations: Vec<String>,
    pub start: usize,
    pub end: usize,
}

/// Term base for one batch. Built once and shared read-only between workers.
pub struct Glossary {
    trie: KeywordTrie<Vec<String>>,
}

impl Glossary {
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = GlossaryEntry>, case_sensitive: bool) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut terms: HashMap<String, (String, Vec<String>)> = HashMap::new();
        for e in entries {
            let term = e.term.trim();
            let tgt = e.translation.trim();
            if term.is_empty() || tgt.is_empty() {
                continue;
            }
            let key = if case_sensitive {
                term.to_string()
            } else {
                term.chars().flat_map(char::to_lowercase).collect()
            };
            let slot = terms.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                (term.to_string(), Vec::new())
            });
            if !slot.1.iter().any(|t| t == tgt) {
                slot.1.push(tgt.to_string());
            }
        }

        let mut trie = KeywordTrie::new(case_sensitive);
        for key in order {
            if let Some((term, translations)) = terms.remove(&key) {
                trie.add_keyword(&term, translations);
            }
        }
        Self { trie }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            trie: KeywordTrie::new(false),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trie.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Finds glossary terms in `text`, skipping any match that overlaps one of the `protected`
    /// byte ranges (placeholders and similar non-translatable spans).
    #[must_use]
    pub fn find(&self, text: &str, protected: &[(usize, usize)]) -> Vec<GlossaryMatch> {
        self.trie
            .extract_keywords(text)
            .into_iter()
            .filter(|m| !protected.iter().any(|&(s, e)| m.start < e && s < m.end))
            .map(|m| GlossaryMatch {
                term: m.term.to_string(),
                translations: m.payload.clone(),
                start: m.start,
                end: m.end,
            })
            .collect()
    }
}

/// Renders matched terms as a markdown table, one row per distinct term.
#[must_use]
pub fn render_glossary_table(matches: &[GlossaryMatch]) -> String {
    if matches.is_empty() {
        return String::new();
    }
    let mut out = String::from("| Source Term | Should be Translated As |\n|---|---|\n");
    let mut seen: Vec<&str> = Vec::new();
    for m in matches {
        if seen.contains(&m.term.as_str()) {
            continue;
        }
        seen.push(&m.term);
        out.push_str(&format!("| {} | {} |\n", m.term, m.translations.join(" or ")));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans<'a, T>(ms: &[KeywordMatch<'a, T>]) -> Vec<(&'a str, usize, usize)> {
        ms.iter().map(|m| (m.term, m.start, m.end)).collect()
    }

    #[test]
    fn longest_match_wins() {
        let mut trie = KeywordTrie::new(true);
        trie.add_keyword("Sub Station", 1);
        trie.add_keyword("Sub", 2);
        let ms = trie.extract_keywords("Sub Station online");
        assert_eq!(spans(&ms), vec![("Sub Station", 0, 11)]);
        assert_eq!(*ms[0].payload, 1);
    }

    #[test]
    fn word_boundary_guard_rejects_partial_words() {
        let mut trie = KeywordTrie::new(true);
        trie.add_keyword("he", ());
        assert!(trie.extract_keywords("hello").is_empty());
        assert!(trie.extract_keywords("he_llo").is_empty());
        assert_eq!(spans(&trie.extract_keywords("he said")), vec![("he", 0, 2)]);
    }

    #[test]
    fn longest_keyword_breaking_boundary_rejects_the_position() {
        let mut trie = KeywordTrie::new(true);
        trie.add_keyword("Sub", ());
        trie.add_keyword("Sub Sta", ());
        assert!(trie.extract_keywords("Sub Station").is_empty());
        assert_eq!(spans(&trie.extract_keywords("Sub Sta ok")), vec![("Sub Sta", 0, 7)]);
        assert_eq!(spans(&trie.extract_keywords("Sub only")), vec![("Sub", 0, 3)]);
    }

    #[test]
    fn rejected_position_advances_one_char() {
        let mut trie = KeywordTrie::new(true);
        trie.add_keyword("ab", ());
        trie.add_keyword("b", ());
        assert_eq!(spans(&trie.extract_keywords("abc b")), vec![("b", 4, 5)]);
        assert_eq!(spans(&trie.extract_keywords("ab b")), vec![("ab", 0, 2), ("b", 3, 4)]);
    }

    #[test]
    fn matches_never_overlap() {
        let mut trie = KeywordTrie::new(true);
        trie.add_keyword("power grid", ());
        trie.add_keyword("grid operator", ());
        let ms = trie.extract_keywords("power grid operator");
        assert_eq!(spans(&ms), vec![("power grid", 0, 10)]);
        for w in ms.windows(2) {
            assert!(w[0].end <= w[1].start);
        }
    }

    #[test]
    fn case_insensitive_keeps_original_offsets() {
        let mut trie = KeywordTrie::new(false);
        trie.add_keyword("straße", "street");
        let text = "Die STRASSE und die Straße.";
        let ms = trie.extract_keywords(text);
        assert_eq!(ms.len(), 1);
        assert_eq!(&text[ms[0].start..ms[0].end], "Straße");
        assert_eq!(ms[0].term, "Straße");
        assert_eq!(ms[0].keyword, "straße");
    }

    #[test]
    fn case_insensitive_multibyte_prefix() {
        let mut trie = KeywordTrie::new(false);
        trie.add_keyword("Äpfel", ());
        let text = "Grüne ÄPFEL!";
        let ms = trie.extract_keywords(text);
        assert_eq!(ms.len(), 1);
        assert_eq!(ms[0].term, "ÄPFEL");
        assert_eq!(ms[0].keyword, "Äpfel");
    }

    #[test]
    fn blank_terms_are_ignored() {
        let mut trie: KeywordTrie<()> = KeywordTrie::new(true);
        assert!(!trie.add_keyword("  ", ()));
        assert!(trie.is_empty());
        assert!(trie.extract_keywords("anything").is_empty());
    }

    #[test]
    fn cjk_terms_match_without_spaces() {
        let mut trie = KeywordTrie::new(true);
        trie.add_keyword("变电站", "substation");
        let text = "这个变电站。";
        let ms = trie.extract_keywords(text);
        assert_eq!(ms.len(), 1);
        assert_eq!(&text[ms[0].start..ms[0].end], "变电站");
    }

    #[test]
    fn glossary_merges_translations_and_skips_protected_spans() {
        let g = Glossary::from_entries(
            vec![
                GlossaryEntry { term: "Save".into(), translation: "Speichern".into() },
                GlossaryEntry { term: "save".into(), translation: "Sichern".into() },
                GlossaryEntry { term: "save".into(), translation: "Sichern".into() },
                GlossaryEntry { term: "file".into(), translation: "Datei".into() },
            ],
            false,
        );
        assert_eq!(g.len(), 2);
        let text = "Save {file} file";
        let ms = g.find(text, &[(5, 11)]);
        assert_eq!(ms.len(), 2);
        assert_eq!(ms[0].term, "Save");
        assert_eq!(ms[0].translations, vec!["Speichern", "Sichern"]);
        assert_eq!(ms[1].start, 12);
    }

    #[test]
    fn glossary_table_lists_each_term_once() {
        let m = |term: &str, start| GlossaryMatch {
            term: term.into(),
            translations: vec!["A".into(), "B".into()],
            start,
            end: start + term.len(),
        };
        let table = render_glossary_table(&[m("x", 0), m("x", 4)]);
        assert_eq!(
            table,
            "| Source Term | Should be Translated As |\n|---|---|\n| x | A or B |"
        );
        assert_eq!(render_glossary_table(&[]), "");
    }
}
