//! Terminal output sanitizing.
//!
//! Interactive execs run under a terminal, so their output carries carriage
//! returns and ANSI/XTerm control sequences that have no place in a build
//! log. Line endings are normalized to `\n` and escape sequences dropped.

use regex::Regex;
use std::sync::LazyLock;

/// CSI, OSC, charset designation, keypad/cursor-save and other two-byte
/// escape sequences.
static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
        r"|\x1b[()][0-9A-Za-z]",
        r"|\x1b[=>78]",
        r"|\x1b[@-Z\\^_]",
    ))
    .expect("escape sequence pattern is a valid regex")
});

/// A tail that may still become one of the sequences above.
static PARTIAL_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\x1b(?:\[[0-?]*[ -/]*|\][^\x07\x1b]*\x1b?|[()])?$")
        .expect("partial escape pattern is a valid regex")
});

static CARRIAGE_RETURNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r+").expect("carriage return pattern is a valid regex"));

/// Longest tail held back waiting for an escape sequence to complete.
const MAX_PENDING_ESCAPE: usize = 256;

/// Sanitize a complete piece of terminal output.
pub fn sanitize(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = CARRIAGE_RETURNS.replace_all(&text, "\n");
    ESCAPE_SEQUENCE.replace_all(&text, "").into_owned()
}

/// Incremental sanitizer for output arriving in arbitrary chunks.
///
/// Chunk boundaries may split a UTF-8 character, a `\r\n` pair or an escape
/// sequence. Such tails are held back until the next chunk, so the
/// concatenated output equals [`sanitize`] of the whole stream.
#[derive(Debug, Default)]
pub struct OutputSanitizer {
    undecoded: Vec<u8>,
    held: String,
}

impl OutputSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the output that is final.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.undecoded.extend_from_slice(bytes);

        let mut text = std::mem::take(&mut self.held);
        text.push_str(&self.decode());

        let keep = held_tail_start(&text);
        self.held = text.split_off(keep);
        sanitize(&text)
    }

    /// Flush everything still held back at end of stream.
    pub fn finish(&mut self) -> String {
        let mut text = std::mem::take(&mut self.held);
        if !self.undecoded.is_empty() {
            text.push_str(&String::from_utf8_lossy(&self.undecoded));
            self.undecoded.clear();
        }
        sanitize(&text)
    }

    /// Decode the buffered bytes, leaving an incomplete trailing character
    /// in the buffer.
    fn decode(&mut self) -> String {
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.undecoded) {
                Ok(text) => {
                    out.push_str(text);
                    self.undecoded.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.undecoded[..valid]));

                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.drain(..valid + invalid);
                        }
                        None => {
                            self.undecoded.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// Byte offset from which `text` must be held back: an unterminated escape
/// sequence, which may itself contain carriage returns, or else a run of
/// trailing `\r` that could be the first half of a `\r\n`.
fn held_tail_start(text: &str) -> usize {
    let without_cr = text.trim_end_matches('\r');

    match without_cr.rfind('\x1b') {
        Some(start)
            if text.len() - start <= MAX_PENDING_ESCAPE
                && PARTIAL_ESCAPE.is_match(&text[start..]) =>
        {
            start
        }
        _ => without_cr.len(),
    }
}
