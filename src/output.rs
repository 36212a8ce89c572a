//! Turns one execution's kernel events into an `ExecutionResult`.

use crate::errors::Result;
use crate::protocol::{ExecutionState, KernelEvent, KernelFrame, StreamName};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

/// Mime types a rich result can carry, richest first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MimeType {
    Png,
    Jpeg,
    Svg,
    Pdf,
    Html,
    Markdown,
    Latex,
    Json,
    Javascript,
    Plain,
    Other(String),
}

/// Preference order when one event offers several representations.
const PREFERENCE: [MimeType; 10] = [
    MimeType::Png,
    MimeType::Jpeg,
    MimeType::Svg,
    MimeType::Pdf,
    MimeType::Html,
    MimeType::Markdown,
    MimeType::Latex,
    MimeType::Json,
    MimeType::Javascript,
    MimeType::Plain,
];

impl MimeType {
    pub fn as_str(&self) -> &str {
        match self {
            MimeType::Png => "image/png",
            MimeType::Jpeg => "image/jpeg",
            MimeType::Svg => "image/svg+xml",
            MimeType::Pdf => "application/pdf",
            MimeType::Html => "text/html",
            MimeType::Markdown => "text/markdown",
            MimeType::Latex => "text/latex",
            MimeType::Json => "application/json",
            MimeType::Javascript => "application/javascript",
            MimeType::Plain => "text/plain",
            MimeType::Other(s) => s,
        }
    }

    /// Payloads of these types travel as base64 text
    pub fn is_binary(&self) -> bool {
        matches!(self, MimeType::Png | MimeType::Jpeg | MimeType::Pdf)
    }
}

impl From<&str> for MimeType {
    fn from(s: &str) -> Self {
        match s {
            "image/png" => MimeType::Png,
            "image/jpeg" => MimeType::Jpeg,
            "image/svg+xml" => MimeType::Svg,
            "application/pdf" => MimeType::Pdf,
            "text/html" => MimeType::Html,
            "text/markdown" => MimeType::Markdown,
            "text/latex" => MimeType::Latex,
            "application/json" => MimeType::Json,
            "application/javascript" => MimeType::Javascript,
            "text/plain" => MimeType::Plain,
            other => MimeType::Other(other.to_string()),
        }
    }
}

impl From<String> for MimeType {
    fn from(s: String) -> Self {
        MimeType::from(s.as_str())
    }
}

impl From<MimeType> for String {
    fn from(m: MimeType) -> Self {
        m.as_str().to_string()
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of one rich result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum RichPayload {
    Text(String),
    Json(Value),
    Base64(String),
}

impl RichPayload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RichPayload::Text(s) | RichPayload::Base64(s) => Some(s.as_str()),
            RichPayload::Json(_) => None,
        }
    }

    /// Raw bytes of a base64 payload
    pub fn decode_bytes(&self) -> Option<Vec<u8>> {
        match self {
            RichPayload::Base64(s) => STANDARD.decode(s).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichResult {
    pub mime_type: MimeType,
    pub payload: RichPayload,
    /// The `text/plain` form offered alongside, if any
    pub plain_text: Option<String>,
    /// True for the value of the cell's trailing expression
    pub is_main_result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub name: String,
    pub message: String,
    pub traceback: Vec<String>,
}

/// Everything one execution produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub results: Vec<RichResult>,
    pub error: Option<ErrorDescriptor>,
    pub execution_count: Option<u32>,
}

impl ExecutionResult {
    /// Main result's plain text, else the first text result, else all of stdout
    pub fn text(&self) -> Option<String> {
        if let Some(main) = self.results.iter().find(|r| r.is_main_result) {
            if let Some(plain) = &main.plain_text {
                return Some(plain.clone());
            }
        }
        let first_text = self.results.iter().find_map(|r| match &r.payload {
            RichPayload::Text(s) => Some(s.clone()),
            _ => r.plain_text.clone(),
        });
        if first_text.is_some() {
            return first_text;
        }
        if self.stdout.is_empty() {
            None
        } else {
            Some(self.stdout.concat())
        }
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.concat()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.concat()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Collects the events answering one request.
///
/// Complete once the kernel has gone busy, sent the matching reply and gone idle again.
#[derive(Debug)]
pub struct OutputAggregator {
    msg_id: String,
    result: ExecutionResult,
    saw_busy: bool,
    saw_reply: bool,
    saw_idle: bool,
}

impl OutputAggregator {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            result: ExecutionResult::default(),
            saw_busy: false,
            saw_reply: false,
            saw_idle: false,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Feed one frame; returns whether the execution is now complete.
    /// Frames for other requests are ignored.
    pub fn accept(&mut self, frame: &KernelFrame) -> Result<bool> {
        if !frame.belongs_to(&self.msg_id) {
            debug!(
                "[OUTPUT] Ignoring {} frame for parent {:?}",
                frame.msg_type, frame.parent_id
            );
            return Ok(self.is_complete());
        }

        match frame.event()? {
            KernelEvent::Status(ExecutionState::Busy) => self.saw_busy = true,
            KernelEvent::Status(ExecutionState::Idle) => {
                if self.saw_busy {
                    self.saw_idle = true;
                }
            }
            KernelEvent::Status(ExecutionState::Starting) => {}
            KernelEvent::Stream { name, text } => {
                let text = strip_ansi(&text);
                match name {
                    StreamName::Stdout => self.result.stdout.push(text),
                    StreamName::Stderr => self.result.stderr.push(text),
                }
            }
            KernelEvent::ExecuteResult {
                execution_count,
                data,
            } => {
                if execution_count.is_some() {
                    self.result.execution_count = execution_count;
                }
                if let Some(rich) = rich_result(&data, true) {
                    self.result.results.push(rich);
                }
            }
            KernelEvent::DisplayData { data } => {
                if let Some(rich) = rich_result(&data, false) {
                    self.result.results.push(rich);
                }
            }
            KernelEvent::Error {
                ename,
                evalue,
                traceback,
            } => {
                self.result.error = Some(ErrorDescriptor {
                    name: ename,
                    message: strip_ansi(&evalue),
                    traceback: traceback.iter().map(|t| strip_ansi(t)).collect(),
                });
            }
            KernelEvent::ExecuteReply {
                execution_count, ..
            } => {
                self.saw_reply = true;
                if execution_count.is_some() {
                    self.result.execution_count = execution_count;
                }
            }
            KernelEvent::ShutdownReply | KernelEvent::Unknown(_) => {}
        }
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.saw_busy && self.saw_reply && self.saw_idle
    }

    pub fn finish(self) -> ExecutionResult {
        self.result
    }
}

/// One rich event becomes one result carrying its richest representation.
fn rich_result(data: &Map<String, Value>, is_main_result: bool) -> Option<RichResult> {
    let plain_text = data
        .get(MimeType::Plain.as_str())
        .and_then(Value::as_str)
        .map(strip_ansi);

    let (mime_type, raw) = PREFERENCE
        .iter()
        .find_map(|m| data.get(m.as_str()).map(|v| (m.clone(), v)))
        .or_else(|| {
            data.iter()
                .next()
                .map(|(k, v)| (MimeType::from(k.as_str()), v))
        })?;

    let payload = if mime_type.is_binary() {
        let text = match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        RichPayload::Base64(normalize_base64(&text))
    } else if mime_type == MimeType::Json {
        RichPayload::Json(raw.clone())
    } else {
        match raw {
            Value::String(s) => RichPayload::Text(s.clone()),
            other => RichPayload::Text(other.to_string()),
        }
    };

    Some(RichResult {
        mime_type,
        payload,
        plain_text,
        is_main_result,
    })
}

/// Kernels may wrap base64 across lines; anything that is not base64 at all is
/// treated as raw bytes and encoded.
fn normalize_base64(text: &str) -> String {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if STANDARD.decode(&compact).is_ok() {
        compact
    } else {
        STANDARD.encode(text.as_bytes())
    }
}

/// Remove terminal escape sequences (colour codes in tracebacks and stream text)
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // CSI: parameters then one final byte in @..~
            Some('[') => {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: terminated by BEL or ESC \
            Some(']') => {
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}
