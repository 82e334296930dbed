use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static DIGIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("digit regex"));
static BRACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[_a-zA-Z0-9\s.:\[\]]*\}").expect("brace placeholder regex"));
static PRINTF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%(\d+\$)?[-+0#]*(\d+|\*)?(\.(\d+|\*))?[hlLzZjpt]*[diouxXeEfFgGcrs%]")
        .expect("printf regex")
});
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:ht|f)tps?://[^\s]+|www\.[^\s]+").expect("url regex")
});
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("word regex"));

const PUNCTUATION_PAIRS: [(char, char); 8] = [
    ('.', '。'),
    (',', '，'),
    ('?', '？'),
    ('!', '！'),
    (':', '：'),
    (';', '；'),
    ('(', '（'),
    (')', '）'),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyOutput,
    Placeholder,
    LineCount,
    Digits,
    Url,
    Whitespace,
    Punctuation,
    Capitalization,
    RepeatedWord,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EmptyOutput => "empty_output",
            Self::Placeholder => "placeholder",
            Self::LineCount => "line_count",
            Self::Digits => "digits",
            Self::Url => "url",
            Self::Whitespace => "whitespace",
            Self::Punctuation => "punctuation",
            Self::Capitalization => "capitalization",
            Self::RepeatedWord => "repeated_word",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Checks a candidate translation against its source text.
pub trait Validator: Send + Sync {
    fn validate(&self, candidate: &str, original: &str) -> Vec<ValidationIssue>;
}

impl<F> Validator for F
where
    F: Fn(&str, &str) -> Vec<ValidationIssue> + Send + Sync,
{
    fn validate(&self, candidate: &str, original: &str) -> Vec<ValidationIssue> {
        self(candidate, original)
    }
}

/// Structural checks: placeholders, layout, numbers and punctuation.
///
/// Every issue sends the candidate back for repair. Severity only ranks them for reporting.
#[derive(Clone, Debug, Default)]
pub struct DefaultValidator;

impl Validator for DefaultValidator {
    fn validate(&self, candidate: &str, original: &str) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if candidate.trim().is_empty() {
            if !original.trim().is_empty() {
                issues.push(ValidationIssue::error(IssueKind::EmptyOutput, "empty_output"));
            }
            return issues;
        }

        check_placeholders(original, candidate, &mut issues);

        let src_lines = original.matches('\n').count();
        let tgt_lines = candidate.matches('\n').count();
        if src_lines != tgt_lines {
            issues.push(ValidationIssue::error(
                IssueKind::LineCount,
                format!("line_count_mismatch src={} tgt={}", src_lines + 1, tgt_lines + 1),
            ));
        }

        let src_digits = digit_counter(original);
        let tgt_digits = digit_counter(candidate);
        if src_digits != tgt_digits {
            issues.push(ValidationIssue::error(
                IssueKind::Digits,
                format!("digits_mismatch src={src_digits:?} tgt={tgt_digits:?}"),
            ));
        }

        let src_urls = string_counter(URL_RE.find_iter(original).map(|m| m.as_str()));
        let tgt_urls = string_counter(URL_RE.find_iter(candidate).map(|m| m.as_str()));
        if src_urls != tgt_urls {
            issues.push(ValidationIssue::error(
                IssueKind::Url,
                format!("url_mismatch src={src_urls:?} tgt={tgt_urls:?}"),
            ));
        }

        check_outer_whitespace(original, candidate, &mut issues);
        check_punctuation(original, candidate, &mut issues);

        if let (Some(s), Some(t)) = (first_cased_char(original), first_cased_char(candidate)) {
            if s.is_uppercase() != t.is_uppercase() {
                issues.push(ValidationIssue::warning(
                    IssueKind::Capitalization,
                    "initial capitalization differs",
                ));
            }
        }

        if let Some(word) = repeated_word(candidate) {
            issues.push(ValidationIssue::warning(
                IssueKind::RepeatedWord,
                format!("repeated word: '{word}'"),
            ));
        }
        issues
    }
}

/// Byte spans of format placeholders (`{name}`, `%s`, ...) in `text`.
#[must_use]
pub fn placeholder_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = BRACE_RE
        .find_iter(text)
        .chain(PRINTF_RE.find_iter(text))
        .map(|m| (m.start(), m.end()))
        .collect();
    spans.sort_unstable();
    spans
}

fn placeholders(text: &str) -> Vec<&str> {
    let mut out: Vec<&str> = BRACE_RE.find_iter(text).map(|m| m.as_str()).collect();
    out.extend(
        PRINTF_RE
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|s| *s != "%%"),
    );
    out
}

fn check_placeholders(original: &str, candidate: &str, issues: &mut Vec<ValidationIssue>) {
    let src = string_counter(placeholders(original));
    let tgt = string_counter(placeholders(candidate));
    let missing: Vec<&str> = src
        .iter()
        .filter(|(k, n)| tgt.get(*k).copied().unwrap_or(0) < **n)
        .map(|(k, _)| *k)
        .collect();
    let extra: Vec<&str> = tgt
        .iter()
        .filter(|(k, n)| src.get(*k).copied().unwrap_or(0) < **n)
        .map(|(k, _)| *k)
        .collect();
    if !missing.is_empty() {
        issues.push(ValidationIssue::error(
            IssueKind::Placeholder,
            format!("missing placeholders: {}", missing.join(", ")),
        ));
    }
    if !extra.is_empty() {
        issues.push(ValidationIssue::error(
            IssueKind::Placeholder,
            format!("extra placeholders: {}", extra.join(", ")),
        ));
    }
}

fn check_outer_whitespace(original: &str, candidate: &str, issues: &mut Vec<ValidationIssue>) {
    let lead = |s: &str| s.trim_start().len() != s.len();
    let trail = |s: &str| s.trim_end().len() != s.len();
    if lead(original) != lead(candidate) {
        issues.push(ValidationIssue::warning(
            IssueKind::Whitespace,
            if lead(original) {
                "missing leading whitespace"
            } else {
                "extra leading whitespace"
            },
        ));
    }
    if trail(original) != trail(candidate) {
        issues.push(ValidationIssue::warning(
            IssueKind::Whitespace,
            if trail(original) {
                "missing trailing whitespace"
            } else {
                "extra trailing whitespace"
            },
        ));
    }
}

fn check_punctuation(original: &str, candidate: &str, issues: &mut Vec<ValidationIssue>) {
    let src = original.trim();
    let tgt = candidate.trim();
    let (Some(s0), Some(t0)) = (src.chars().next(), tgt.chars().next()) else {
        return;
    };
    if let Some(msg) = compare_punctuation(s0, t0, "starting") {
        issues.push(ValidationIssue::warning(IssueKind::Punctuation, msg));
    }

    // "file(s)" style plural markers don't count as closing punctuation.
    let src_end = match src.to_lowercase().strip_suffix("(s)") {
        Some(_) if src.len() > 3 => src[..src.len() - 3].trim_end(),
        _ => src,
    };
    let (Some(s1), Some(t1)) = (src_end.chars().last(), tgt.chars().last()) else {
        return;
    };
    if let Some(msg) = compare_punctuation(s1, t1, "ending") {
        issues.push(ValidationIssue::warning(IssueKind::Punctuation, msg));
    }
}

fn compare_punctuation(s: char, t: char, which: &str) -> Option<String> {
    let s_punc = is_mapped_punctuation(s);
    let t_punc = is_mapped_punctuation(t);
    if s_punc != t_punc {
        return Some(format!("{which} punctuation presence differs"));
    }
    if s_punc && !punctuation_equivalent(s, t) {
        return Some(format!("{which} punctuation differs: '{s}' vs '{t}'"));
    }
    None
}

fn is_mapped_punctuation(ch: char) -> bool {
    PUNCTUATION_PAIRS
        .iter()
        .any(|&(ascii, wide)| ch == ascii || ch == wide)
}

fn punctuation_equivalent(a: char, b: char) -> bool {
    a == b
        || PUNCTUATION_PAIRS
            .iter()
            .any(|&(ascii, wide)| (a == ascii && b == wide) || (a == wide && b == ascii))
}

fn first_cased_char(text: &str) -> Option<char> {
    let ch = text.trim_start().chars().next()?;
    let cased = ch.to_lowercase().ne(ch.to_uppercase());
    cased.then_some(ch)
}

fn repeated_word(text: &str) -> Option<String> {
    let mut prev: Option<regex::Match<'_>> = None;
    for m in WORD_RE.find_iter(text) {
        if let Some(p) = prev {
            let gap = &text[p.end()..m.start()];
            let separated_by_space = !gap.is_empty() && gap.chars().all(char::is_whitespace);
            let same = p.as_str().to_lowercase() == m.as_str().to_lowercase();
            let numeric = m.as_str().chars().all(|c| c.is_ascii_digit());
            if separated_by_space && same && !numeric {
                return Some(m.as_str().to_string());
            }
        }
        prev = Some(m);
    }
    None
}

#[must_use]
pub fn digit_counter(text: &str) -> HashMap<String, usize> {
    let mut out: HashMap<String, usize> = HashMap::new();
    for m in DIGIT_RE.find_iter(text) {
        *out.entry(m.as_str().to_string()).or_insert(0) += 1;
    }
    out
}

fn string_counter<'a>(items: impl IntoIterator<Item = &'a str>) -> BTreeMap<&'a str, usize> {
    let mut out = BTreeMap::new();
    for s in items {
        *out.entry(s).or_insert(0) += 1;
    }
    out
}

/// Renders issues as a bulleted list for repair prompts and logs.
#[must_use]
pub fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(issues: &[ValidationIssue]) -> Vec<IssueKind> {
        issues.iter().map(|i| i.kind).collect()
    }

    #[test]
    fn clean_translation_has_no_issues() {
        let issues = DefaultValidator.validate("Hallo {name}, du hast 3 Nachrichten.", "Hello {name}, you have 3 messages.");
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn missing_and_extra_placeholders_are_errors() {
        let issues = DefaultValidator.validate("Hallo {user}", "Hello {name}");
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.kind == IssueKind::Placeholder && i.is_error()));
        assert!(issues[0].message.contains("{name}"));
        assert!(issues[1].message.contains("{user}"));
    }

    #[test]
    fn printf_placeholders_are_checked() {
        let issues = DefaultValidator.validate("%d Dateien", "%d files of %s");
        assert_eq!(kinds(&issues), vec![IssueKind::Placeholder]);
    }

    #[test]
    fn line_count_and_digits() {
        let issues = DefaultValidator.validate("Zeile 1 Zeile 2", "Line 1\nLine 2");
        assert_eq!(kinds(&issues), vec![IssueKind::LineCount]);
        let issues = DefaultValidator.validate("Seite 4", "Page 5");
        assert_eq!(kinds(&issues), vec![IssueKind::Digits]);
    }

    #[test]
    fn fullwidth_punctuation_is_equivalent() {
        let issues = DefaultValidator.validate("你好，世界。", "Hello, world.");
        assert!(issues.is_empty(), "{issues:?}");
        let issues = DefaultValidator.validate("Hallo Welt", "Hello world!");
        assert_eq!(kinds(&issues), vec![IssueKind::Punctuation]);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn plural_marker_is_not_ending_punctuation() {
        let issues = DefaultValidator.validate("Dateien", "File(s)");
        assert!(issues.iter().all(|i| i.kind != IssueKind::Punctuation), "{issues:?}");
    }

    #[test]
    fn capitalization_and_repeated_words_are_warnings() {
        let issues = DefaultValidator.validate("hallo die die Welt", "Hello the world");
        assert_eq!(
            kinds(&issues),
            vec![IssueKind::Capitalization, IssueKind::RepeatedWord]
        );
        assert!(issues.iter().all(|i| !i.is_error()));
    }

    #[test]
    fn empty_output_is_an_error() {
        let issues = DefaultValidator.validate("  ", "Hello");
        assert_eq!(kinds(&issues), vec![IssueKind::EmptyOutput]);
        assert!(DefaultValidator.validate("", "").is_empty());
    }

    #[test]
    fn closures_are_validators() {
        let v = |c: &str, _o: &str| {
            if c.contains("bad") {
                vec![ValidationIssue::error(IssueKind::Placeholder, "bad")]
            } else {
                Vec::new()
            }
        };
        assert_eq!(v.validate("bad", "x").len(), 1);
        assert!(v.validate("good", "x").is_empty());
    }

    #[test]
    fn placeholder_spans_cover_both_styles() {
        let text = "{a} and %s";
        assert_eq!(placeholder_spans(text), vec![(0, 3), (8, 10)]);
    }
}
