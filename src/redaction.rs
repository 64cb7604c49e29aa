//! Secret scrubbing for audit payloads
//!
//! Every event payload and run snapshot the steward persists goes through
//! [`redact`] first. Values under sensitive-looking keys are replaced
//! wholesale; string leaves are scanned for PEM blocks, bearer tokens and
//! API-key-shaped tokens. Each object that had something redacted anywhere
//! beneath it gains `_redacted: true` and a sorted `_redaction_reasons` list.
//!
//! Redaction is idempotent: running it on its own output returns the same
//! value. Non-string scalars pass through untouched.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Replacement for values under sensitive keys
pub const REDACTED: &str = "REDACTED";
pub const REDACTED_MARKER_KEY: &str = "_redacted";
pub const REDACTION_REASONS_KEY: &str = "_redaction_reasons";

const REASON_SENSITIVE_KEY: &str = "sensitive_key";
const REASON_PEM_BLOCK: &str = "pem_block";
const REASON_BEARER_TOKEN: &str = "bearer_token";
const REASON_API_KEY: &str = "api_key_pattern";

/// Substrings that mark a key as sensitive (matched against the lowercased key)
const SENSITIVE_KEY_HINTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "auth",
    "private_key",
    "pem",
    "env",
];

// Upper bound on replacement passes over one string
const MAX_STRING_PASSES: usize = 8;

static PEM_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-----BEGIN [A-Z ]+-----[\s\S]*?-----END [A-Z ]+-----")
        .expect("Valid PEM block regex")
});

static BEARER_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbearer\s+[a-z0-9._\-]{8,}\b").expect("Valid bearer token regex")
});

static API_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:sk|api|token|key)_[a-z0-9]{8,}\b").expect("Valid API key regex")
});

/// Return a redacted copy of `value`
pub fn redact(value: &Value) -> Value {
    walk(value).0
}

/// Redact a JSON object in place of a `Map`, for callers that build payloads as maps
pub fn redact_map(map: &Map<String, Value>) -> Map<String, Value> {
    match walk_object(map) {
        (Value::Object(out), _) => out,
        _ => Map::new(),
    }
}

/// Whether `key` looks like it holds a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Scrub secret-shaped substrings; returns the new string and the reasons that fired
pub fn redact_str(input: &str) -> (String, BTreeSet<&'static str>) {
    let patterns: [(&Regex, &str, &'static str); 3] = [
        (&PEM_BLOCK, "REDACTED_PEM_BLOCK", REASON_PEM_BLOCK),
        (&BEARER_TOKEN, "Bearer REDACTED_TOKEN", REASON_BEARER_TOKEN),
        (&API_KEY, "REDACTED_API_KEY", REASON_API_KEY),
    ];

    let mut reasons = BTreeSet::new();
    let mut current = input.to_string();
    for _ in 0..MAX_STRING_PASSES {
        let mut changed = false;
        for (regex, replacement, reason) in patterns.iter() {
            if regex.is_match(&current) {
                let next = regex.replace_all(&current, *replacement).into_owned();
                if next != current {
                    current = next;
                    changed = true;
                }
                reasons.insert(*reason);
            }
        }
        if !changed {
            break;
        }
    }
    (current, reasons)
}

fn walk(value: &Value) -> (Value, BTreeSet<String>) {
    match value {
        Value::Object(map) => walk_object(map),
        Value::Array(items) => {
            let mut reasons = BTreeSet::new();
            let out = items
                .iter()
                .map(|item| {
                    let (redacted, item_reasons) = walk(item);
                    reasons.extend(item_reasons);
                    redacted
                })
                .collect();
            (Value::Array(out), reasons)
        }
        Value::String(s) => {
            let (out, fired) = redact_str(s);
            let reasons = fired.into_iter().map(str::to_string).collect();
            (Value::String(out), reasons)
        }
        other => (other.clone(), BTreeSet::new()),
    }
}

fn walk_object(map: &Map<String, Value>) -> (Value, BTreeSet<String>) {
    let mut reasons = existing_reasons(map);
    let mut already_marked = matches!(map.get(REDACTED_MARKER_KEY), Some(Value::Bool(true)));
    let mut out = Map::with_capacity(map.len() + 2);

    for (key, val) in map {
        if key == REDACTED_MARKER_KEY || key == REDACTION_REASONS_KEY {
            continue;
        }
        if is_sensitive_key(key) {
            out.insert(key.clone(), Value::String(REDACTED.to_string()));
            reasons.insert(REASON_SENSITIVE_KEY.to_string());
            continue;
        }
        let (redacted, child_reasons) = walk(val);
        reasons.extend(child_reasons);
        out.insert(key.clone(), redacted);
    }

    if !reasons.is_empty() {
        already_marked = true;
    }
    if already_marked {
        out.insert(REDACTED_MARKER_KEY.to_string(), Value::Bool(true));
        out.insert(
            REDACTION_REASONS_KEY.to_string(),
            Value::Array(reasons.iter().cloned().map(Value::String).collect()),
        );
    } else {
        // Nothing redacted: caller-supplied marker keys pass through as-is
        for key in [REDACTED_MARKER_KEY, REDACTION_REASONS_KEY] {
            if let Some(val) = map.get(key) {
                out.insert(key.to_string(), val.clone());
            }
        }
    }
    (Value::Object(out), reasons)
}

fn existing_reasons(map: &Map<String, Value>) -> BTreeSet<String> {
    match map.get(REDACTION_REASONS_KEY) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    }
}
