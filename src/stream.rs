//! # Stream Module
//!
//! Reads the server-sent-event transcript produced by a RAGFlow agent
//! completion and recovers the final answer from it.
//!
//! The agent streams a series of `data: {...}` events: progress updates
//! ("Agent is running...") followed, eventually, by the real answer. There is
//! no terminator we can rely on, so every line is kept until the connection
//! closes and the transcript is then scanned backwards. The most recent event
//! shaped like a final answer wins.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Prefix of every SSE event line.
pub const DATA_MARKER: &str = "data:";

/// Answers containing this text are progress updates, not results.
pub const RUNNING_MARKER: &str = "is running";

/// Longest slice of an offending line quoted back in errors and logs.
const MAX_QUOTED_LINE: usize = 200;

// =============================================================================
// ERRORS
// =============================================================================
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The service answered with a bare JSON error object instead of events.
    #[error("agent returned an error: {0}")]
    Agent(String),

    /// A line that is neither an event nor a JSON error object.
    #[error("unexpected line in agent stream: {0}")]
    UnexpectedLine(String),
}

// =============================================================================
// LINE REASSEMBLY
// =============================================================================
/// Turns arbitrary body chunks into complete text lines.
///
/// Network chunks can split a line (or a multi-byte character) anywhere, so
/// bytes are held back until a `\n` arrives. A trailing `\r` is dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

// =============================================================================
// TRANSCRIPT
// =============================================================================
/// Every non-blank line of one streaming response, in arrival order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain a line. Blank lines (SSE event separators) are dropped.
    pub fn push_line(&mut self, line: impl Into<String>) {
        let line = line.into();
        if !line.trim().is_empty() {
            self.lines.push(line);
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Extract the keyword list from the final answer; see [`extract_keywords`].
    pub fn keywords(&self) -> Result<Option<Vec<String>>, StreamError> {
        extract_keywords(self.lines.as_slice())
    }
}

impl<S: Into<String>> FromIterator<S> for Transcript {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut transcript = Transcript::new();
        for line in iter {
            transcript.push_line(line);
        }
        transcript
    }
}

// =============================================================================
// EVENT CLASSIFICATION
// =============================================================================
/// One classified transcript line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Blank,
    /// A `data:` event carrying both an answer and a session id.
    /// May still be a progress update; see [`StreamEvent::is_final`].
    Answer { answer: String, session_id: String },
    /// Any other `data:` event, including empty or malformed payloads.
    Other,
    /// A bare JSON object with a `message` field.
    Error(String),
    /// A bare line that is not a JSON error object.
    Unrecognized,
}

impl StreamEvent {
    /// True for an answer event that is not a progress update.
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Answer { answer, .. } if !answer.contains(RUNNING_MARKER))
    }
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    answer: String,
    session_id: String,
}

/// Classify one raw transcript line.
pub fn classify(line: &str) -> StreamEvent {
    if line.trim().is_empty() {
        return StreamEvent::Blank;
    }

    if let Some(payload) = line.strip_prefix(DATA_MARKER) {
        let payload = payload.trim();
        if payload.is_empty() {
            return StreamEvent::Other;
        }
        return match serde_json::from_str::<EventPayload>(payload) {
            Ok(event) => StreamEvent::Answer {
                answer: event.data.answer,
                session_id: event.data.session_id,
            },
            Err(_) => StreamEvent::Other,
        };
    }

    match serde_json::from_str::<serde_json::Value>(line.trim()) {
        Ok(value) => match value.get("message") {
            Some(serde_json::Value::String(message)) => StreamEvent::Error(message.clone()),
            Some(other) => StreamEvent::Error(other.to_string()),
            None => StreamEvent::Unrecognized,
        },
        Err(_) => StreamEvent::Unrecognized,
    }
}

// =============================================================================
// ANSWER EXTRACTION
// =============================================================================
/// Recover the keyword list from a complete transcript.
///
/// Scans from the most recent line backwards:
/// - progress updates and non-answer events are skipped
/// - a bare error line stops the scan with [`StreamError::Agent`]
/// - any other bare line stops the scan with [`StreamError::UnexpectedLine`]
///
/// Returns `Ok(None)` when no final answer exists. When several final answers
/// are present the most recent is used and a warning is logged.
pub fn extract_keywords<S: AsRef<str>>(lines: &[S]) -> Result<Option<Vec<String>>, StreamError> {
    let mut chosen: Option<(String, String)> = None;
    let mut finals = 0usize;

    for line in lines.iter().rev() {
        let line = line.as_ref();
        let event = classify(line);
        let is_final = event.is_final();

        match event {
            StreamEvent::Blank | StreamEvent::Other => {}
            StreamEvent::Answer { answer, session_id } => {
                if !is_final {
                    debug!(session_id = %session_id, "Skipping progress event");
                    continue;
                }
                finals += 1;
                if chosen.is_none() {
                    chosen = Some((session_id, answer));
                }
            }
            StreamEvent::Error(message) => {
                error!(message = %message, "Agent stream contained an error payload");
                return Err(StreamError::Agent(message));
            }
            StreamEvent::Unrecognized => {
                let quoted = quote(line);
                error!(line = %quoted, "Agent stream contained an unrecognised line");
                return Err(StreamError::UnexpectedLine(quoted));
            }
        }
    }

    if finals > 1 {
        warn!(
            count = finals,
            "Stream contained several final answers, using the most recent"
        );
    }

    let Some((session_id, answer)) = chosen else {
        warn!(lines = lines.len(), "No final answer found in agent stream");
        return Ok(None);
    };

    let keywords = split_keywords(&answer);
    info!(session_id = %session_id, keywords = ?keywords, "Extracted keywords");
    Ok(Some(keywords))
}

/// Split an answer on commas, trimming and dropping empty pieces.
pub fn split_keywords(answer: &str) -> Vec<String> {
    answer
        .split(',')
        .map(str::trim)
        .filter(|kw| !kw.is_empty())
        .map(String::from)
        .collect()
}

fn quote(line: &str) -> String {
    if line.chars().count() <= MAX_QUOTED_LINE {
        return line.to_string();
    }
    let head: String = line.chars().take(MAX_QUOTED_LINE).collect();
    format!("{}...", head)
}
