//! Upstream JSON decoding with path-aware error messages.

use super::FetchError;

/// Decode an upstream body, reporting the failing JSON path and a snippet of
/// the offending line as a [`FetchError::ParseFailure`].
pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, FetchError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|err| {
        let path = err.path().to_string();
        let inner = err.inner();
        let (line, column) = (inner.line(), inner.column());

        let raw = inner.to_string();
        let location = format!(" at line {line} column {column}");
        let message = describe_mismatch(raw.strip_suffix(&location).unwrap_or(&raw));

        let mut detail = String::new();
        if !path.is_empty() && path != "." {
            detail.push_str(&format!("at '{path}': "));
        }
        detail.push_str(&format!(
            "{message} (line {line} col {column}) near `{}`",
            excerpt(body, line, column, 24)
        ));
        FetchError::ParseFailure(detail)
    })
}

/// Rewrite serde's "invalid type: X, expected Y" into "expected Y, got X".
fn describe_mismatch(message: &str) -> String {
    message
        .strip_prefix("invalid type: ")
        .and_then(|rest| rest.split_once(", expected "))
        .map(|(actual, expected)| format!("expected {}, got {actual}", expected.trim()))
        .unwrap_or_else(|| message.to_owned())
}

/// Up to `width` characters of `line` centred on `column` (both 1-based).
fn excerpt(body: &str, line: usize, column: usize, width: usize) -> String {
    let Some(text) = body.lines().nth(line.saturating_sub(1)) else {
        return String::new();
    };
    let chars: Vec<char> = text.chars().collect();
    let centre = column.saturating_sub(1).min(chars.len());
    let start = centre.saturating_sub(width / 2);
    let end = (start + width).min(chars.len());
    chars[start..end].iter().collect::<String>().trim().to_owned()
}
