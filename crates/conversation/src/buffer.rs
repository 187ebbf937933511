//! Stream buffering policy: decides, delta by delta, what is prose.
//!
//! Text is committed to the visible assistant message as soon as it cannot be
//! part of a tool-call envelope. From the first `[TOOL_CALL:` (or a trailing
//! fragment of it such as `"[TO"`) onwards, text is held back until one of:
//!
//! - a complete envelope for the current boundary resolves → tool call
//! - the held text stops looking like an envelope header → flushed as prose
//! - a complete but malformed envelope appears → flushed as prose
//! - the held text grows past [`BufferPolicy::max_buffer_chars`] → flushed
//!
//! The prose heuristics are best-effort. A model that discusses the envelope
//! syntax may have that text held briefly before it is released.
//!
//! The policy itself is stateless: the held text lives in the conversation
//! snapshot and is passed back in with each delta.

use toolchat_core::tool::ToolCall;
use tracing::debug;
use crate::envelope::{self, BoundaryId};

/// Held text longer than this is released as prose.
pub const DEFAULT_MAX_BUFFER_CHARS: usize = 500;

/// Tunables for the buffering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub max_buffer_chars: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_buffer_chars: DEFAULT_MAX_BUFFER_CHARS,
        }
    }
}

/// A confirmed envelope, ready for the approval flow.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedToolCall {
    pub call: ToolCall,
    /// The exact envelope text, restored verbatim if the call is rejected
    pub source_text: String,
    /// Text that followed the envelope in the same delta
    pub trailing_text: String,
}

/// Why held text was released as prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Whitespace before a lowercase word, or sentence punctuation, in the header
    ProsePattern,
    /// Header cannot become `[TOOL_CALL:<boundary>]` for this round
    BoundaryMismatch,
    /// A complete envelope whose body did not decode
    MalformedEnvelope,
    /// Grew past the length cap without completing
    LengthCap,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::ProsePattern => "prose_pattern",
            Self::BoundaryMismatch => "boundary_mismatch",
            Self::MalformedEnvelope => "malformed_envelope",
            Self::LengthCap => "length_cap",
        };
        f.write_str(reason)
    }
}

/// The outcome of feeding one delta through the policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferStep {
    /// Text safe to append to the visible message, in order
    pub commit: String,
    /// Text still held back; `None` when nothing is ambiguous
    pub held: Option<String>,
    /// Set when a complete envelope resolved in this step
    pub detected: Option<DetectedToolCall>,
}

impl BufferStep {
    fn prose(text: String) -> Self {
        Self {
            commit: text,
            ..Self::default()
        }
    }
}

impl BufferPolicy {
    pub fn new(max_buffer_chars: usize) -> Self {
        Self { max_buffer_chars }
    }

    /// Classify `delta` given the currently `held` text.
    pub fn step(&self, held: Option<&str>, delta: &str, boundary: &BoundaryId) -> BufferStep {
        match held {
            None => self.scan_fresh(delta, boundary),
            Some(held) => {
                let mut candidate = String::with_capacity(held.len() + delta.len());
                candidate.push_str(held);
                candidate.push_str(delta);
                self.resolve_candidate(candidate, boundary)
            }
        }
    }

    /// Not buffering: commit everything before a possible envelope start.
    fn scan_fresh(&self, delta: &str, boundary: &BoundaryId) -> BufferStep {
        let split = envelope::locate_envelope_start(delta)
            .or_else(|| envelope::partial_prefix_start(delta));
        let Some(at) = split else {
            return BufferStep::prose(delta.to_string());
        };

        let (before, candidate) = delta.split_at(at);
        let mut step = self.resolve_candidate(candidate.to_string(), boundary);
        step.commit.insert_str(0, before);
        step
    }

    /// `candidate` starts at a `[`; decide whether to resolve, release or hold it.
    ///
    /// A complete envelope for the current boundary anywhere in the candidate
    /// wins over the header heuristics, so a rejected opening never swallows
    /// a real call that follows it.
    fn resolve_candidate(&self, candidate: String, boundary: &BoundaryId) -> BufferStep {
        if let Some(found) = envelope::scan(&candidate, boundary) {
            let Some(call) = found.call else {
                debug!(reason = %RejectReason::MalformedEnvelope, "Releasing held text as prose");
                let (prose, rest) = candidate.split_at(found.end);
                let mut step = self.scan_fresh(rest, boundary);
                step.commit.insert_str(0, prose);
                return step;
            };
            let (before, rest) = candidate.split_at(found.start);
            let (source, trailing) = rest.split_at(found.end - found.start);
            return BufferStep {
                commit: before.to_string(),
                held: None,
                detected: Some(DetectedToolCall {
                    call,
                    source_text: source.to_string(),
                    trailing_text: trailing.to_string(),
                }),
            };
        }

        if let Some(reason) = header_rejection(&candidate, boundary) {
            debug!(%reason, held = candidate.len(), "Releasing held text as prose");
            return self.release(&candidate, boundary);
        }
        if candidate.chars().count() > self.max_buffer_chars {
            debug!(reason = %RejectReason::LengthCap, held = candidate.len(), "Releasing held text as prose");
            return self.release(&candidate, boundary);
        }

        BufferStep {
            held: Some(candidate),
            ..BufferStep::default()
        }
    }

    /// Commit the candidate up to the next possible envelope start after its
    /// opening `[` and keep classifying the remainder.
    fn release(&self, candidate: &str, boundary: &BoundaryId) -> BufferStep {
        let next = candidate
            .get(1..)
            .and_then(|rest| {
                envelope::locate_envelope_start(rest).or_else(|| envelope::partial_prefix_start(rest))
            })
            .map(|at| at + 1);
        let Some(at) = next else {
            return BufferStep::prose(candidate.to_string());
        };

        let (prose, rest) = candidate.split_at(at);
        let mut step = self.resolve_candidate(rest.to_string(), boundary);
        step.commit.insert_str(0, prose);
        step
    }
}

/// Checks the header region (between the opening `[` and the first `]`).
fn header_rejection(candidate: &str, boundary: &BoundaryId) -> Option<RejectReason> {
    let header_end = candidate.find(']').unwrap_or(candidate.len());
    if looks_like_prose(candidate.get(1..header_end).unwrap_or_default()) {
        return Some(RejectReason::ProsePattern);
    }

    let header = boundary.open_tag();
    let consistent = if candidate.len() < header.len() {
        header.starts_with(candidate)
    } else {
        candidate.starts_with(&header)
    };
    (!consistent).then_some(RejectReason::BoundaryMismatch)
}

fn looks_like_prose(header: &str) -> bool {
    if header.contains(['.', ',', '!', '?']) {
        return true;
    }
    let mut chars = header.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() && chars.peek().is_some_and(|next| next.is_lowercase()) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn boundary() -> BoundaryId {
        BoundaryId::new("c0ffee")
    }

    fn echo_call() -> ToolCall {
        ToolCall::new("echo", json!({"x": 1}).as_object().cloned().unwrap())
    }

    fn envelope_text() -> String {
        envelope::encode(&echo_call(), &boundary())
    }

    /// Feed `deltas` in order; returns (committed text, final held, detection).
    fn feed<'a>(
        policy: &BufferPolicy,
        deltas: impl IntoIterator<Item = &'a str>,
    ) -> (String, Option<String>, Option<DetectedToolCall>) {
        let mut committed = String::new();
        let mut held: Option<String> = None;
        for delta in deltas {
            let step = policy.step(held.as_deref(), delta, &boundary());
            committed.push_str(&step.commit);
            held = step.held;
            if step.detected.is_some() {
                return (committed, held, step.detected);
            }
        }
        (committed, held, None)
    }

    #[test]
    fn plain_prose_is_committed_immediately() {
        let step = BufferPolicy::default().step(None, "Hello there.", &boundary());
        assert_eq!(step.commit, "Hello there.");
        assert!(step.held.is_none());
        assert!(step.detected.is_none());
    }

    #[test]
    fn single_delta_envelope_resolves_without_buffering() {
        let delta = format!("Let me check. {} Done soon", envelope_text());
        let step = BufferPolicy::default().step(None, &delta, &boundary());
        assert_eq!(step.commit, "Let me check. ");
        assert!(step.held.is_none());
        let detected = step.detected.unwrap();
        assert_eq!(detected.call, echo_call());
        assert_eq!(detected.source_text, envelope_text());
        assert_eq!(detected.trailing_text, " Done soon");
    }

    #[test]
    fn envelope_split_at_every_chunk_size_reassembles() {
        let text = format!("Sure! {}", envelope_text());
        for size in 1..=9 {
            let chars: Vec<char> = text.chars().collect();
            let chunks: Vec<String> = chars.chunks(size).map(|c| c.iter().collect()).collect();
            let (committed, held, detected) =
                feed(&BufferPolicy::default(), chunks.iter().map(String::as_str));
            assert_eq!(committed, "Sure! ", "chunk size {size}");
            assert!(held.is_none(), "chunk size {size}");
            let detected = detected.unwrap_or_else(|| panic!("chunk size {size} did not resolve"));
            assert_eq!(detected.call, echo_call());
            assert_eq!(detected.source_text, envelope_text());
        }
    }

    #[test]
    fn lone_opening_bracket_is_held_then_reassembled() {
        let full = envelope_text();
        let (open, rest) = full.split_at(1);
        let (mid, tail) = rest.split_at(rest.len() / 2);

        let policy = BufferPolicy::default();
        let first = policy.step(None, &format!("Okay {open}"), &boundary());
        assert_eq!(first.commit, "Okay ");
        assert_eq!(first.held.as_deref(), Some("["));

        let (committed, held, detected) = feed(&policy, [format!("Okay {open}").as_str(), mid, tail]);
        assert_eq!(committed, "Okay ");
        assert!(held.is_none());
        assert_eq!(detected.unwrap().call, echo_call());
    }

    #[test]
    fn bracket_that_is_not_an_envelope_is_released() {
        let (committed, held, detected) =
            feed(&BufferPolicy::default(), ["see [", "1] for details"]);
        assert_eq!(committed, "see [1] for details");
        assert!(held.is_none());
        assert!(detected.is_none());
    }

    #[test]
    fn prose_discussing_the_syntax_is_flushed_verbatim() {
        let deltas = ["You can write ", "[TOOL_CALL:", " then the id", ". That's it."];
        let (committed, held, detected) = feed(&BufferPolicy::default(), deltas);
        assert_eq!(committed, deltas.concat());
        assert!(held.is_none());
        assert!(detected.is_none());
    }

    #[test]
    fn sentence_punctuation_in_header_is_prose() {
        let step = BufferPolicy::default().step(None, "[TOOL_CALL:abc, etc", &boundary());
        assert_eq!(step.commit, "[TOOL_CALL:abc, etc");
        assert!(step.held.is_none());
    }

    #[test]
    fn stale_boundary_is_released() {
        let stale = envelope::encode(&echo_call(), &BoundaryId::new("deadbeef"));
        let step = BufferPolicy::default().step(None, &stale, &boundary());
        assert_eq!(step.commit, stale);
        assert!(step.detected.is_none());
        assert!(step.held.is_none());
    }

    #[test]
    fn malformed_envelope_is_released_as_prose() {
        let text = "[TOOL_CALL:c0ffee]{\"name\": oops}[/TOOL_CALL:c0ffee] after";
        let step = BufferPolicy::default().step(None, text, &boundary());
        assert_eq!(step.commit, text);
        assert!(step.held.is_none());
        assert!(step.detected.is_none());
    }

    #[test]
    fn rejected_header_does_not_hide_a_later_envelope() {
        let delta = format!("The syntax is [TOOL_CALL: id]. Calling now: {}", envelope_text());
        let step = BufferPolicy::default().step(None, &delta, &boundary());
        assert_eq!(step.commit, "The syntax is [TOOL_CALL: id]. Calling now: ");
        assert!(step.held.is_none());
        let detected = step.detected.unwrap();
        assert_eq!(detected.call, echo_call());
        assert_eq!(detected.source_text, envelope_text());
    }

    #[test]
    fn rejected_header_then_envelope_across_deltas() {
        let full = envelope_text();
        let (head, tail) = full.split_at(10);
        let policy = BufferPolicy::default();
        let first = policy.step(None, "Write [TOOL_CALL:", &boundary());
        assert_eq!(first.held.as_deref(), Some("[TOOL_CALL:"));

        let second = format!(" the id]. Now: {head}");
        let (committed, held, detected) =
            feed(&policy, ["Write [TOOL_CALL:", second.as_str(), tail]);
        assert_eq!(committed, "Write [TOOL_CALL: the id]. Now: ");
        assert!(held.is_none());
        assert_eq!(detected.unwrap().call, echo_call());
    }

    #[test]
    fn held_bracket_turning_into_a_citation_keeps_scanning() {
        let policy = BufferPolicy::default();
        let first = policy.step(None, "see [", &boundary());
        assert_eq!(first.commit, "see ");

        let second = policy.step(
            first.held.as_deref(),
            &format!("1] ok {} bye", envelope_text()),
            &boundary(),
        );
        assert_eq!(format!("{}{}", first.commit, second.commit), "see [1] ok ");
        let detected = second.detected.unwrap();
        assert_eq!(detected.call, echo_call());
        assert_eq!(detected.trailing_text, " bye");
    }

    #[test]
    fn citation_followed_by_a_partial_envelope_holds_the_partial() {
        let (committed, held, detected) =
            feed(&BufferPolicy::default(), ["see [", "1] ok [TOOL_CALL:c0"]);
        assert_eq!(committed, "see [1] ok ");
        assert_eq!(held.as_deref(), Some("[TOOL_CALL:c0"));
        assert!(detected.is_none());
    }

    #[test]
    fn stale_boundary_followed_by_current_envelope() {
        let stale = envelope::encode(&echo_call(), &BoundaryId::new("deadbeef"));
        let delta = format!("{stale} retrying: {}", envelope_text());
        let step = BufferPolicy::default().step(None, &delta, &boundary());
        assert_eq!(step.commit, format!("{stale} retrying: "));
        assert_eq!(step.detected.unwrap().source_text, envelope_text());
    }

    #[test]
    fn stale_boundary_then_current_envelope_across_deltas() {
        let stale = envelope::encode(&echo_call(), &BoundaryId::new("deadbeef"));
        let full = envelope_text();
        let (head, tail) = full.split_at(full.len() / 2);
        let (committed, held, detected) =
            feed(&BufferPolicy::default(), [stale.as_str(), " again ", head, tail]);
        assert_eq!(committed, format!("{stale} again "));
        assert!(held.is_none());
        assert_eq!(detected.unwrap().call, echo_call());
    }

    #[test]
    fn malformed_envelope_followed_by_a_valid_one() {
        let malformed = "[TOOL_CALL:c0ffee]{\"name\": oops}[/TOOL_CALL:c0ffee]";
        let delta = format!("{malformed} fixed: {}", envelope_text());
        let step = BufferPolicy::default().step(None, &delta, &boundary());
        assert_eq!(step.commit, format!("{malformed} fixed: "));
        assert_eq!(step.detected.unwrap().call, echo_call());
    }

    #[test]
    fn unterminated_envelope_is_released_at_the_cap() {
        let policy = BufferPolicy::new(40);
        let first = policy.step(None, "[TOOL_CALL:c0ffee]{\"name\":\"echo\",", &boundary());
        assert!(first.held.is_some());
        assert!(first.commit.is_empty());

        let second = policy.step(first.held.as_deref(), "\"arguments\":{\"text\":\"a long", &boundary());
        assert!(second.held.is_none());
        assert_eq!(
            second.commit,
            "[TOOL_CALL:c0ffee]{\"name\":\"echo\",\"arguments\":{\"text\":\"a long"
        );
    }

    #[test]
    fn body_whitespace_does_not_trigger_prose_heuristics() {
        let call = ToolCall::new(
            "echo",
            json!({"text": "hello world. how are you?"}).as_object().cloned().unwrap(),
        );
        let text = envelope::encode(&call, &boundary());
        let (open, rest) = text.split_at(30);
        let (_, _, detected) = feed(&BufferPolicy::default(), [open, rest]);
        assert_eq!(detected.unwrap().call, call);
    }

    #[test]
    fn prose_heuristics() {
        assert!(looks_like_prose("TOOL_CALL: is"));
        assert!(looks_like_prose("TOOL_CALL:x."));
        assert!(looks_like_prose("TOOL_CALL:why?"));
        assert!(!looks_like_prose("TOOL_CALL:c0ffee"));
        assert!(!looks_like_prose("TOOL_CALL: X"));
    }
}
