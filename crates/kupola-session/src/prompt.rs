//! Shell prompt and working-directory detection.
//!
//! Input typed into a shell session is only forwarded once the remote
//! shell has printed a prompt, so keystrokes are not lost or swallowed by
//! startup output. Detection is pattern matching over the tail of recent
//! output; it is a heuristic over untrusted free-form text, not a parser.
//! A missed prompt only delays readiness (safe), so the patterns are
//! tuned to reject prompt-lookalikes inside program output even at the
//! cost of false negatives. When no prompt ever matches, the session
//! simply stays in the not-ready state and no working directory is
//! inferred; that is a documented limitation of the heuristic.

use std::collections::VecDeque;

use regex::Regex;

/// How much recent output the scanner looks at.
pub const OUTPUT_RING_CAPACITY: usize = 512;

/// A candidate prompt line longer than this is assumed to be program
/// output that merely ends in a prompt-like character.
const MAX_PROMPT_LINE_LEN: usize = 120;

/// Bounded ring of the most recent output bytes.
pub struct OutputRing {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        for &b in chunk {
            if self.bytes.len() == self.capacity {
                self.bytes.pop_front();
            }
            self.bytes.push_back(b);
        }
    }

    /// The buffered tail as text, lossily decoded.
    pub fn tail(&self) -> String {
        let (a, b) = self.bytes.as_slices();
        let mut bytes = Vec::with_capacity(a.len() + b.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new(OUTPUT_RING_CAPACITY)
    }
}

/// Result of scanning an output tail.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PromptScan {
    /// A prompt is sitting at the end of the output.
    pub ready: bool,
    /// Working directory extracted from the prompt, when its shape
    /// carried one.
    pub cwd: Option<String>,
}

/// Prompt pattern matcher.
pub struct PromptScanner {
    // user@host:/path$ and user@host:~/path#
    full: Regex,
    // bare /path $ or ~/path #
    bare: Regex,
    // anything else ending in an anchored prompt character
    generic: Regex,
}

impl PromptScanner {
    pub fn new() -> Self {
        Self {
            full: Regex::new(
                r"(?m)^[A-Za-z0-9._-]+@[A-Za-z0-9._-]+:(?P<cwd>~[^\s]*|/[^\s]*)\s*[#$]\s?$",
            )
            .expect("full prompt pattern"),
            bare: Regex::new(r"^(?P<cwd>~(?:/[^\s]*)?|/[^\s]*)\s*[#$]\s?$")
                .expect("bare prompt pattern"),
            generic: Regex::new(r"[#$%>]\s?$").expect("generic prompt pattern"),
        }
    }

    /// Scan the output tail for a prompt at its very end.
    ///
    /// Only the text after the last newline is considered: a prompt is an
    /// unterminated line, so anything already followed by a newline is
    /// program output by definition.
    pub fn scan(&self, tail: &str) -> PromptScan {
        let line = tail.rsplit(['\n', '\r']).next().unwrap_or(tail);
        let line = strip_csi(line);
        let line = line.trim_start();

        if line.is_empty() || line.len() > MAX_PROMPT_LINE_LEN {
            return PromptScan::default();
        }

        if let Some(caps) = self.full.captures(line) {
            return PromptScan {
                ready: true,
                cwd: Some(caps["cwd"].to_string()),
            };
        }
        if let Some(caps) = self.bare.captures(line) {
            return PromptScan {
                ready: true,
                cwd: Some(caps["cwd"].trim_end().to_string()),
            };
        }
        if self.generic.is_match(line) && generic_anchor_ok(line) {
            return PromptScan {
                ready: true,
                cwd: None,
            };
        }

        PromptScan::default()
    }
}

impl Default for PromptScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Extra anchor constraints for the generic pattern.
///
/// `>` only counts when it follows an alphanumeric (rejects `-->`, `%>`
/// and similar fragments); a trailing `%` marker must be the zsh-style
/// `name% ` shape rather than something like `100%`.
fn generic_anchor_ok(line: &str) -> bool {
    let trimmed = line.trim_end();
    let mut chars = trimmed.chars().rev();
    let Some(marker) = chars.next() else {
        return false;
    };
    let before = chars.next();
    match marker {
        '$' | '#' => true,
        '>' => before.is_some_and(|c| c.is_ascii_alphanumeric()),
        '%' => before.is_none_or(|c| c.is_ascii_alphabetic()),
        _ => false,
    }
}

/// Drop ANSI CSI escape sequences so a colored prompt still matches.
fn strip_csi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
