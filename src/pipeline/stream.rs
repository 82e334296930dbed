//! Incremental extraction of the translation from a chain-of-thought response.
//!
//! The model is asked to answer as `<thinking>...</thinking><translation>...</translation>`.
//! [`StreamParser`] forwards only the translation section while chunks arrive. It never emits a
//! byte that could still turn out to be part of the closing marker, so the emitted increments plus
//! the final flush always equal a one-shot parse of the whole response, however it was chunked.

use regex::Regex;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CotMarkers {
    pub think_open: String,
    pub think_close: String,
    pub output_open: String,
    pub output_close: String,
}

impl Default for CotMarkers {
    fn default() -> Self {
        Self {
            think_open: "<thinking>".to_string(),
            think_close: "</thinking>".to_string(),
            output_open: "<translation>".to_string(),
            output_close: "</translation>".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseState {
    Waiting,
    Thinking,
    Translating,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The model started its reasoning section.
    Thinking,
    Text(String),
}

/// How the final text was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Extraction {
    /// Closing marker seen, or plain mode.
    Streamed,
    /// Translation section opened but never closed; the streamed part is the answer, minus a
    /// cut-off closing marker.
    Unterminated,
    /// Text between the output markers.
    Tagged,
    /// Everything after the last reasoning close marker.
    AfterThinking,
    /// Nothing recognizable; the raw response as-is.
    Literal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedResponse {
    pub text: String,
    /// Part of `text` not already emitted through [`StreamEvent::Text`].
    pub flush: String,
    pub extraction: Extraction,
}

type Strategy = fn(&str, &CotMarkers) -> Option<String>;

/// Fallbacks for responses that never opened a translation section, tried in order.
const FALLBACK_STRATEGIES: [(Extraction, Strategy); 3] = [
    (Extraction::Tagged, between_output_markers),
    (Extraction::AfterThinking, after_thinking),
    (Extraction::Literal, literal),
];

pub struct StreamParser {
    markers: Option<CotMarkers>,
    state: ParseState,
    buffer: String,
    raw: String,
    emitted: String,
}

impl StreamParser {
    #[must_use]
    pub fn new(markers: CotMarkers) -> Self {
        Self {
            markers: Some(markers),
            state: ParseState::Waiting,
            buffer: String::new(),
            raw: String::new(),
            emitted: String::new(),
        }
    }

    /// Pass-through parser for models without a reasoning section.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            markers: None,
            state: ParseState::Translating,
            buffer: String::new(),
            raw: String::new(),
            emitted: String::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ParseState {
        self.state
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        self.raw.push_str(chunk);
        if self.state == ParseState::Done {
            return events;
        }
        self.buffer.push_str(chunk);

        let Some(m) = self.markers.clone() else {
            let text = std::mem::take(&mut self.buffer);
            self.emit(text, &mut events);
            return events;
        };

        loop {
            match self.state {
                ParseState::Waiting => {
                    let think = self.buffer.find(&m.think_open);
                    let output = self.buffer.find(&m.output_open);
                    match (think, output) {
                        (t, Some(o)) if t.map_or(true, |t| o < t) => {
                            self.buffer.drain(..o + m.output_open.len());
                            self.state = ParseState::Translating;
                        }
                        (Some(t), _) => {
                            self.buffer.drain(..t + m.think_open.len());
                            self.state = ParseState::Thinking;
                            events.push(StreamEvent::Thinking);
                        }
                        _ => break,
                    }
                }
                ParseState::Thinking => {
                    if let Some(o) = self.buffer.find(&m.output_open) {
                        self.buffer.drain(..o + m.output_open.len());
                        self.state = ParseState::Translating;
                        continue;
                    }
                    let keep = partial_marker_suffix(&self.buffer, &m.output_open);
                    let cut = self.buffer.len() - keep;
                    self.buffer.drain(..cut);
                    break;
                }
                ParseState::Translating => {
                    if let Some(c) = self.buffer.find(&m.output_close) {
                        let text: String = self.buffer[..c].to_string();
                        self.buffer.clear();
                        self.state = ParseState::Done;
                        self.emit(text, &mut events);
                    } else {
                        let keep = partial_marker_suffix(&self.buffer, &m.output_close);
                        let cut = self.buffer.len() - keep;
                        let text: String = self.buffer.drain(..cut).collect();
                        self.emit(text, &mut events);
                    }
                    break;
                }
                ParseState::Done => break,
            }
        }
        events
    }

    fn emit(&mut self, text: String, events: &mut Vec<StreamEvent>) {
        let text = if self.emitted.is_empty() {
            text.trim_start().to_string()
        } else {
            text
        };
        if text.is_empty() {
            return;
        }
        self.emitted.push_str(&text);
        events.push(StreamEvent::Text(text));
    }

    /// Ends the stream and settles the final text.
    #[must_use]
    pub fn finish(self) -> ParsedResponse {
        let Some(m) = self.markers.as_ref() else {
            return ParsedResponse {
                text: self.emitted,
                flush: String::new(),
                extraction: Extraction::Streamed,
            };
        };
        match self.state {
            ParseState::Done => ParsedResponse {
                text: self.emitted,
                flush: String::new(),
                extraction: Extraction::Streamed,
            },
            // A withheld tail of two or more chars is taken as a cut-off closing marker and
            // dropped. A lone first marker char is more likely text and is kept.
            ParseState::Translating => {
                let mut flush = if self.buffer.chars().count() == 1 {
                    self.buffer
                } else {
                    String::new()
                };
                if self.emitted.is_empty() {
                    flush = flush.trim_start().to_string();
                }
                let mut text = self.emitted;
                text.push_str(&flush);
                ParsedResponse {
                    text,
                    flush,
                    extraction: Extraction::Unterminated,
                }
            }
            ParseState::Waiting | ParseState::Thinking => {
                let (text, extraction) = fallback_extract(&self.raw, m);
                ParsedResponse {
                    flush: text.clone(),
                    text,
                    extraction,
                }
            }
        }
    }
}

/// One-shot parse of a complete response; identical to streaming it through [`StreamParser`].
#[must_use]
pub fn parse_complete(raw: &str, markers: &CotMarkers) -> ParsedResponse {
    let mut parser = StreamParser::new(markers.clone());
    let _ = parser.push(raw);
    let mut parsed = parser.finish();
    parsed.flush = parsed.text.clone();
    parsed
}

/// Runs the fallback strategies in priority order. The last one always succeeds.
#[must_use]
pub fn fallback_extract(raw: &str, markers: &CotMarkers) -> (String, Extraction) {
    for (kind, strategy) in FALLBACK_STRATEGIES {
        if let Some(text) = strategy(raw, markers) {
            return (text, kind);
        }
    }
    (raw.trim_start().to_string(), Extraction::Literal)
}

fn between_output_markers(raw: &str, m: &CotMarkers) -> Option<String> {
    let pattern = format!(
        "(?s){}(.*?){}",
        regex::escape(&m.output_open),
        regex::escape(&m.output_close)
    );
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(raw)?;
    Some(caps.get(1)?.as_str().trim_start().to_string())
}

fn after_thinking(raw: &str, m: &CotMarkers) -> Option<String> {
    let idx = raw.rfind(&m.think_close)?;
    let rest = &raw[idx + m.think_close.len()..];
    let rest = rest.replace(&m.output_open, "").replace(&m.output_close, "");
    let rest = rest.trim_start();
    (!rest.is_empty()).then(|| rest.to_string())
}

fn literal(raw: &str, _m: &CotMarkers) -> Option<String> {
    Some(raw.trim_start().to_string())
}

/// Length of the longest suffix of `buffer` that is a proper prefix of `marker`.
fn partial_marker_suffix(buffer: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(buffer.len());
    (1..=max)
        .rev()
        .find(|&n| {
            buffer.is_char_boundary(buffer.len() - n)
                && marker.is_char_boundary(n)
                && buffer.ends_with(&marker[..n])
        })
        .unwrap_or(0)
}
