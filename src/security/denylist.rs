//! Textual denylist for submitted snippets.
//!
//! Patterns are matched case-insensitively anywhere in the input. This is a
//! blunt filter: `getattr(__builtins__, "ev" + "al")`, base64 payloads, or any
//! module not listed here all pass. Treat a clean scan as "nothing obvious",
//! never as "safe".

use regex::{Regex, RegexBuilder};

/// Filesystem, process and interpreter-escape primitives rejected by default.
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"import\s+(os|sys|shutil|subprocess|socket)",
    r"__import__",
    r"eval\(",
    r"exec\(",
    r"open\(",
    r"system\(",
    r"popen\(",
    r"rm\s+",
    r"del\s+",
];

/// Marker substituted for denylisted fragments by [`sanitize_input`].
pub const BLOCKED_MARKER: &str = "[BLOCKED]";

/// Shell metacharacters stripped by [`sanitize_input`].
const STRIPPED_CHARS: &[char] = &[';', '\\', '<', '>', '/', '&', '|', '$', '`'];

pub struct Denylist {
    patterns: Vec<Regex>,
}

impl Denylist {
    /// Compiles `patterns`. Fails on the first invalid one.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> anyhow::Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| anyhow::anyhow!("Invalid denylist pattern '{pattern}': {e}"))?;
            compiled.push(regex);
        }
        Ok(Self { patterns: compiled })
    }

    /// Returns the first pattern that matches `code`, if any.
    pub fn scan(&self, code: &str) -> Result<(), &str> {
        match self.patterns.iter().find(|p| p.is_match(code)) {
            Some(pattern) => Err(pattern.as_str()),
            None => Ok(()),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Replaces every denylisted fragment in `text` with [`BLOCKED_MARKER`].
    fn redact(&self, text: &str) -> String {
        self.patterns.iter().fold(text.to_string(), |acc, pattern| {
            pattern.replace_all(&acc, BLOCKED_MARKER).into_owned()
        })
    }
}

/// Cleans free text before it is echoed or logged.
///
/// Empty or over-long input (more than `max_len` characters) yields an empty
/// string. Otherwise shell metacharacters are removed, denylisted fragments
/// are replaced with `[BLOCKED]`, and the result is cut to `max_len`
/// characters.
pub fn sanitize_input(denylist: &Denylist, text: &str, max_len: usize) -> String {
    if text.is_empty() || text.chars().count() > max_len {
        return String::new();
    }

    let stripped: String = text.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect();
    let redacted = denylist.redact(&stripped);

    redacted.chars().take(max_len).collect()
}
