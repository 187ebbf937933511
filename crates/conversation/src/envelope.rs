//! The tool-call envelope: how a structured call travels inside plain text.
//!
//! ```text
//! [TOOL_CALL:<boundary>]{"name": "...", "arguments": {...}}[/TOOL_CALL:<boundary>]
//! ```
//!
//! The boundary id is minted fresh for every generation round and handed to
//! the model in the system prompt, so the delimiters never collide with prose
//! and the body never needs escaping. Everything here is stateless.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolchat_core::tool::ToolCall;
use tracing::warn;
use uuid::Uuid;

/// Literal every opening delimiter starts with, whatever the boundary.
pub const OPEN_PREFIX: &str = "[TOOL_CALL:";

/// Literal every closing delimiter starts with.
pub const CLOSE_PREFIX: &str = "[/TOOL_CALL:";

const BOUNDARY_LEN: usize = 12;

/// Per-round token scoping the delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundaryId(String);

impl BoundaryId {
    /// Mint a fresh random boundary.
    pub fn generate() -> Self {
        let mut token = Uuid::new_v4().simple().to_string();
        token.truncate(BOUNDARY_LEN);
        Self(token)
    }

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `[TOOL_CALL:<boundary>]`
    pub fn open_tag(&self) -> String {
        format!("{OPEN_PREFIX}{}]", self.0)
    }

    /// `[/TOOL_CALL:<boundary>]`
    pub fn close_tag(&self) -> String {
        format!("{CLOSE_PREFIX}{}]", self.0)
    }
}

impl std::fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A complete `[TOOL_CALL:id]…[/TOOL_CALL:id]` span found in a text.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeMatch {
    /// Byte offset of the opening `[`
    pub start: usize,
    /// Byte offset just past the closing `]`
    pub end: usize,
    /// The decoded call, or `None` when the body is malformed
    pub call: Option<ToolCall>,
}

/// Encode `call` into an envelope for `boundary`.
pub fn encode(call: &ToolCall, boundary: &BoundaryId) -> String {
    let body = serde_json::json!({
        "name": call.name,
        "arguments": call.arguments,
    });
    format!("{}{}{}", boundary.open_tag(), body, boundary.close_tag())
}

/// Decode the first complete envelope in `text`.
///
/// Malformed JSON, a missing or non-string `name`, or non-object `arguments`
/// all yield `None`; the failure is logged, never raised.
pub fn parse(text: &str, boundary: &BoundaryId) -> Option<ToolCall> {
    scan(text, boundary).and_then(|found| found.call)
}

/// Locate the first complete envelope in `text`, decoding its body.
///
/// Matching is non-greedy: the body ends at the first closing tag after the
/// opening tag, and may span newlines. Later envelopes are ignored.
pub fn scan(text: &str, boundary: &BoundaryId) -> Option<EnvelopeMatch> {
    let open = boundary.open_tag();
    let close = boundary.close_tag();

    let start = text.find(&open)?;
    let body_start = start + open.len();
    let body_len = text[body_start..].find(&close)?;
    let body_end = body_start + body_len;

    Some(EnvelopeMatch {
        start,
        end: body_end + close.len(),
        call: decode_body(&text[body_start..body_end]),
    })
}

/// Byte offset of the earliest `[TOOL_CALL:` in `text`.
pub fn locate_envelope_start(text: &str) -> Option<usize> {
    text.find(OPEN_PREFIX)
}

/// Byte offset of a trailing fragment that could grow into `[TOOL_CALL:`.
///
/// Only proper prefixes count (`"["`, `"[TOOL"`, …); a full prefix is found
/// by [`locate_envelope_start`].
pub fn partial_prefix_start(text: &str) -> Option<usize> {
    let longest = (OPEN_PREFIX.len() - 1).min(text.len());
    (1..=longest).rev().find_map(|len| {
        let at = text.len() - len;
        (text.is_char_boundary(at) && OPEN_PREFIX.starts_with(&text[at..])).then_some(at)
    })
}

fn decode_body(body: &str) -> Option<ToolCall> {
    let value: Value = match serde_json::from_str(body.trim()) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Tool call envelope body is not valid JSON");
            return None;
        }
    };

    let Value::Object(mut object) = value else {
        warn!("Tool call envelope body is not a JSON object");
        return None;
    };

    let name = match object.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => {
            warn!("Tool call envelope is missing a string `name`");
            return None;
        }
    };

    let arguments = match object.remove("arguments") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(arguments)) => arguments,
        Some(_) => {
            warn!(tool = %name, "Tool call `arguments` is not a JSON object");
            return None;
        }
    };

    Some(ToolCall::new(name, arguments))
}
