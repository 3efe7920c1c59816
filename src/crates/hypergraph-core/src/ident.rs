//! Identifier validation and deterministic hashing.
//!
//! Node names, input names, and output names must all be valid identifiers:
//! non-empty, `[A-Za-z_][A-Za-z0-9_]*`, not a keyword, and never the reserved
//! [`END`] sentinel. Hashing is SHA-256 over a type-tagged, length-prefixed
//! byte encoding so that reordering or concatenating parts can never collide.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{HypergraphError, Result};

/// Reserved sentinel a gate returns to terminate the path through it.
///
/// `END` is a valid gate target but never a valid node, input, or output
/// name.
pub const END: &str = "END";

/// Keywords rejected as identifiers.
const KEYWORDS: &[&str] = &[
    "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true",
    "type", "unsafe", "use", "where", "while",
];

/// Whether `name` is a valid hypergraph identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    if name.is_empty() || name == END || KEYWORDS.contains(&name) {
        return false;
    }
    if name.contains('.') || name.contains('/') {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate an identifier, describing `what` it names in the error.
pub fn validate_identifier(name: &str, what: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(HypergraphError::config(format!(
            "invalid {what} '{name}': identifiers are non-empty, start with a letter or '_', \
             contain only letters, digits and '_', and may not be a keyword or the reserved \
             'END' sentinel. Rename it."
        )))
    }
}

/// Conversion of name arguments into a validated, ordered name list.
///
/// Accepts a single name or any ordered collection of names; empty strings
/// are rejected. This is the single entry point node constructors use for
/// their `inputs`/`outputs`/`targets` arguments.
pub trait IntoNames {
    fn into_names(self) -> Result<Vec<String>>;
}

fn collect_names<I>(iter: I) -> Result<Vec<String>>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut names = Vec::new();
    for name in iter {
        let name = name.into();
        if name.is_empty() {
            return Err(HypergraphError::config(
                "empty string in a name list. Remove it or provide a real identifier."
                    .to_string(),
            ));
        }
        names.push(name);
    }
    Ok(names)
}

impl IntoNames for &str {
    fn into_names(self) -> Result<Vec<String>> {
        collect_names([self])
    }
}

impl IntoNames for String {
    fn into_names(self) -> Result<Vec<String>> {
        collect_names([self])
    }
}

impl<const N: usize> IntoNames for [&str; N] {
    fn into_names(self) -> Result<Vec<String>> {
        collect_names(self)
    }
}

impl IntoNames for &[&str] {
    fn into_names(self) -> Result<Vec<String>> {
        collect_names(self.iter().copied())
    }
}

impl IntoNames for Vec<String> {
    fn into_names(self) -> Result<Vec<String>> {
        collect_names(self)
    }
}

impl IntoNames for Vec<&str> {
    fn into_names(self) -> Result<Vec<String>> {
        collect_names(self)
    }
}

/// SHA-256 over type-tagged, length-prefixed parts, as lowercase hex.
///
/// Each part is encoded as `b's' + u64_le(len) + utf8_bytes`, so
/// `["ab", "c"]` and `["a", "bc"]` hash differently, as do parts in a
/// different order.
pub fn hash_definition<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update(b"s");
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    to_hex(&hasher.finalize())
}

/// Canonical digest over input names and serialized values.
///
/// Names are visited in sorted order and values are serialized with all
/// nested object keys sorted, so the digest is independent of map insertion
/// order. Used as the second half of a cache key.
pub fn input_digest<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut pairs: Vec<(&String, &Value)> = values.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));

    let mut parts = Vec::with_capacity(pairs.len() * 2);
    for (name, value) in pairs {
        parts.push(name.clone());
        parts.push(canonical_json(value));
    }
    hash_definition(parts)
}

/// Serialize a value with nested object keys sorted.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
