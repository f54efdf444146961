//! Structural position tracking over partially-emitted HTML.

use once_cell::sync::Lazy;
use regex::Regex;

/// Structural zones of an HTML document, in emission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DocumentState {
    #[default]
    Start,
    BeforeHtml,
    BeforeHead,
    InHead,
    BetweenHeadAndBody,
    InBody,
    AfterBody,
    AfterHtml,
}

fn marker(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid marker regex")
}

static DOCTYPE: Lazy<Regex> = Lazy::new(|| marker(r"(?i)<!doctype[^>]*>"));
static OPEN_HTML: Lazy<Regex> = Lazy::new(|| marker(r"(?i)<html[\s/>]"));
// `[\s/>]` keeps `<head` from matching `<header`.
static OPEN_HEAD: Lazy<Regex> = Lazy::new(|| marker(r"(?i)<head[\s/>]"));
static CLOSE_HEAD: Lazy<Regex> = Lazy::new(|| marker(r"(?i)</head\s*>"));
static OPEN_BODY: Lazy<Regex> = Lazy::new(|| marker(r"(?i)<body[\s/>]"));
static CLOSE_BODY: Lazy<Regex> = Lazy::new(|| marker(r"(?i)</body\s*>"));
static CLOSE_HTML: Lazy<Regex> = Lazy::new(|| marker(r"(?i)</html\s*>"));

/// Advances a [`DocumentState`] as output chunks are observed. Transitions
/// are monotonic, and optional structure may be skipped: a document that
/// omits the doctype or `<html>` still advances when a later marker shows
/// up. Markers split across chunk boundaries are not matched.
#[derive(Debug, Default)]
pub struct DocumentTracker {
    state: DocumentState,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Scan `chunk` for the marker that ends the current zone, consuming as
    /// many transitions as the chunk contains.
    pub fn advance(&mut self, chunk: &str) {
        let mut cursor = 0;
        while let Some((state, end)) = self.next_marker(chunk, cursor) {
            self.state = state;
            cursor = end;
        }
    }

    fn next_marker(&self, chunk: &str, cursor: usize) -> Option<(DocumentState, usize)> {
        let transitions: [(&Regex, DocumentState); 7] = [
            (&DOCTYPE, DocumentState::BeforeHtml),
            (&OPEN_HTML, DocumentState::BeforeHead),
            (&OPEN_HEAD, DocumentState::InHead),
            (&CLOSE_HEAD, DocumentState::BetweenHeadAndBody),
            (&OPEN_BODY, DocumentState::InBody),
            (&CLOSE_BODY, DocumentState::AfterBody),
            (&CLOSE_HTML, DocumentState::AfterHtml),
        ];
        for (regex, next_state) in transitions {
            if next_state <= self.state {
                continue;
            }
            if let Some(found) = regex.find(&chunk[cursor..]) {
                return Some((next_state, cursor + found.end()));
            }
        }
        None
    }
}
