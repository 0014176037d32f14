use std::collections::BTreeSet;

pub const REDACTED: &str = "[REDACTED]";

/// Replace every sensitive value in `text`, longest first so that a value
/// containing another is never partially revealed. JSON-escaped spellings are
/// replaced too.
#[must_use]
pub fn redact_sensitive(text: &str, sensitive_values: &BTreeSet<String>) -> String {
    let mut sorted: Vec<String> = sensitive_values
        .iter()
        .filter(|v| v.len() >= 3)
        .flat_map(|value| {
            let escaped = serde_json::to_string(value)
                .ok()
                .and_then(|quoted| {
                    quoted
                        .strip_prefix('"')
                        .and_then(|inner| inner.strip_suffix('"'))
                        .map(str::to_string)
                })
                .filter(|escaped| escaped != value);
            std::iter::once(value.clone()).chain(escaped)
        })
        .collect();
    sorted.sort_by_key(|value| std::cmp::Reverse(value.len()));

    let mut result = text.to_string();
    for value in sorted {
        result = result.replace(&value, REDACTED);
    }
    result
}
