//! `?` placeholder substitution.
//!
//! A `?` is a placeholder when it is outside single- and double-quoted
//! literals and not preceded by an unconsumed backslash. `\?` anywhere is
//! an escaped question mark: the backslash is removed and the `?` kept as
//! text. Every other backslash sequence passes through untouched but still
//! shields the following character from quote tracking.

use drizzle_core::error::{PlaceholderError, PlaceholderErrorKind};
use drizzle_core::{Error, Result, Value};

use crate::types;

/// A template after placeholder recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedQuery {
    /// Template text with `\?` escapes resolved
    pub text: String,
    /// Byte offsets of recognized placeholders within `text`
    pub positions: Vec<usize>,
}

/// Find the placeholders in `template`.
pub fn scan_placeholders(template: &str) -> ScannedQuery {
    let mut text = String::with_capacity(template.len());
    let mut positions = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in template.chars() {
        if escaped {
            if c != '?' {
                text.push('\\');
            }
            text.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if quote == Some(c) => {
                quote = None;
                text.push(c);
            }
            '\'' | '"' if quote.is_none() => {
                quote = Some(c);
                text.push(c);
            }
            '?' if quote.is_none() => {
                positions.push(text.len());
                text.push(c);
            }
            c => text.push(c),
        }
    }
    if escaped {
        text.push('\\');
    }

    ScannedQuery { text, positions }
}

/// Substitute `values` into `template`, left to right.
///
/// Fails when the placeholder count differs from `values.len()` or when a
/// value has no SQL literal form.
pub fn parse_query(
    template: &str,
    values: &[Value],
    escape: &dyn Fn(&str) -> String,
) -> Result<String> {
    let scanned = scan_placeholders(template);
    if scanned.positions.len() != values.len() {
        return Err(Error::Placeholder(PlaceholderError {
            kind: PlaceholderErrorKind::CountMismatch,
            message: "Wrong number of values to escape".to_string(),
        }));
    }
    if values.is_empty() {
        return Ok(scanned.text);
    }

    let mut out = String::with_capacity(scanned.text.len() + values.len() * 8);
    let mut last = 0;
    for (&position, value) in scanned.positions.iter().zip(values) {
        out.push_str(&scanned.text[last..position]);
        out.push_str(&types::render_value(value, escape)?);
        last = position + 1;
    }
    out.push_str(&scanned.text[last..]);
    tracing::trace!(template, sql = %out, "resolved placeholders");
    Ok(out)
}
