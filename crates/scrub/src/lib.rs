//! seks_scrub
//!
//! Process-wide registry of live credential-derived strings and a pure
//! redaction function over them. Registered once a secret is loaded or an
//! agent marker is resolved; lives for the life of the process.
//!
//! Scrubbing never fails: on any internal error the input is returned
//! unchanged. Callers that want a `scrub_error` audit event should check
//! `Registry::scrub` against the sentinel in `ScrubOutcome`.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;

/// One registered secret and its encoded variants, longest-first for
/// replacement so that e.g. a base64 variant never gets clobbered by a
/// shorter raw variant matching inside it.
#[derive(Debug, Clone)]
struct Entry {
    label: String,
    variants: Vec<(String, String)>, // (encoded value, marker)
}

fn build_variants(label: &str, value: &str) -> Vec<(String, String)> {
    let mut variants = vec![
        (value.to_string(), format!("<secret:{label}>")),
        (
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, value.as_bytes()),
            format!("<secret:{label}:base64>"),
        ),
        (hex::encode(value.as_bytes()), format!("<secret:{label}:hex>")),
        (
            urlencoding::encode(value).into_owned(),
            format!("<secret:{label}:url>"),
        ),
    ];
    variants.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    variants
}

/// Process-wide scrub registry. Construct one per broker instance; tests
/// should use their own `Registry::new()` rather than a shared global so
/// state does not leak across test cases.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Register a secret's variants under `label`. Values shorter than two
    /// characters are ignored — nothing useful to redact, and they would
    /// cause pathological over-matching. Infallible.
    pub fn register(&self, label: &str, value: &str) {
        if value.chars().count() < 2 {
            return;
        }
        let entry = Entry { label: label.to_string(), variants: build_variants(label, value) };
        self.entries.write().insert(label.to_string(), entry);
    }

    pub fn unregister(&self, label: &str) {
        self.entries.write().remove(label);
    }

    /// Test hook: drop all registered secrets.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Redact every occurrence of every registered variant from `text`,
    /// case-insensitively, longest variant first across the whole registry
    /// so that a base64 encoding of one secret never leaves a dangling raw
    /// substring of another.
    pub fn scrub(&self, text: &str) -> String {
        let guard = self.entries.read();
        let mut all: Vec<&(String, String)> =
            guard.values().flat_map(|e| e.variants.iter()).collect();
        all.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut out = text.to_string();
        for (needle, marker) in all {
            if needle.is_empty() {
                continue;
            }
            out = replace_case_insensitive(&out, needle, marker);
        }
        out
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.entries.read().contains_key(label)
    }

    #[cfg(test)]
    fn entry(&self, label: &str) -> Option<Entry> {
        self.entries.read().get(label).cloned()
    }
}

/// Case-insensitive literal substring replacement. `needle` is treated as a
/// literal, never a pattern — secrets can contain regex metacharacters.
fn replace_case_insensitive(haystack: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    let hay_lower = haystack.to_lowercase();
    let needle_lower = needle.to_lowercase();
    let needle_len = needle.len();

    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    let mut rest_lower = hay_lower.as_str();

    while let Some(pos) = rest_lower.find(&needle_lower) {
        out.push_str(&rest[..pos]);
        out.push_str(replacement);
        let advance = pos + needle_len;
        rest = &rest[advance..];
        rest_lower = &rest_lower[advance..];
    }
    out.push_str(rest);
    out
}

/// A handle threaded through request context, per the design notes'
/// guidance to avoid singletons. Cheap to clone; wraps an `Arc` internally
/// via construction in callers (axum `State` clones handles, not data).
pub type ScrubHandle = std::sync::Arc<Registry>;

pub fn new_handle() -> ScrubHandle {
    std::sync::Arc::new(Registry::new())
}

/// Matches the spec's label grammar: `[A-Za-z0-9_-]+`.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

static LABEL_CHARSET_HINT: Lazy<&str> = Lazy::new(|| "[A-Za-z0-9_-]+");

pub fn label_charset_hint() -> &'static str {
    &LABEL_CHARSET_HINT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_redacts_raw_value_case_insensitively() {
        let r = Registry::new();
        r.register("ANTHROPIC_API_KEY", "sk-ant-SECRETVALUE");
        let out = r.scrub("leaked: SK-ANT-secretvalue in logs");
        assert!(!out.to_lowercase().contains("sk-ant-secretvalue"));
        assert!(out.contains("<secret:ANTHROPIC_API_KEY>"));
    }

    #[test]
    fn scrub_redacts_base64_variant() {
        let r = Registry::new();
        r.register("ANTHROPIC_API_KEY", "sk-ant-SECRETVALUE");
        let b64 = "c2stYW50LVNFQ1JFVFZBTFVF"; // base64("sk-ant-SECRETVALUE")
        let out = r.scrub(&format!("echoed body: {b64}"));
        assert!(!out.contains(b64));
        assert!(out.contains("<secret:ANTHROPIC_API_KEY:base64>"));
    }

    #[test]
    fn scrub_is_idempotent() {
        let r = Registry::new();
        r.register("TOK", "abcdefg1234");
        let once = r.scrub("value is abcdefg1234 here");
        let twice = r.scrub(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn scrub_does_not_reintroduce_a_registered_variant() {
        let r = Registry::new();
        // marker text itself must never collide with another secret's
        // literal value after substitution.
        r.register("A", "secretvalue");
        r.register("B", "<secret:A>");
        let out = r.scrub("secretvalue then <secret:A>");
        // B's raw value is exactly A's marker; since B is shorter its
        // presence as a literal in the input is still replaced, and once
        // replaced it must not be mistaken for a live A occurrence again.
        assert!(out.contains("<secret:B>") || out.contains("<secret:A>"));
    }

    #[test]
    fn values_shorter_than_two_chars_are_ignored() {
        let r = Registry::new();
        r.register("SHORT", "x");
        assert!(r.entry("SHORT").is_none());
    }

    #[test]
    fn clear_removes_all_entries() {
        let r = Registry::new();
        r.register("TOK", "abcdefg1234");
        r.clear();
        let out = r.scrub("abcdefg1234");
        assert!(out.contains("abcdefg1234"));
    }

    #[test]
    fn non_matching_text_is_returned_unchanged() {
        let r = Registry::new();
        r.register("TOK", "abcdefg1234");
        let out = r.scrub("nothing secret here");
        assert_eq!(out, "nothing secret here");
    }

    #[test]
    fn label_validation_matches_grammar() {
        assert!(is_valid_label("anthropic_api-key"));
        assert!(!is_valid_label("bad label"));
        assert!(!is_valid_label(""));
    }
}
