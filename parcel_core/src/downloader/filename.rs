/// Extract a plain `filename=` value (with or without quotes) from a
/// `Content-Disposition` header value.
pub fn extract_filename(disposition: &str) -> Option<String> {
    let lower = disposition.to_lowercase();
    let key = "filename=";
    let idx = lower.find(key)?;
    let rest = &disposition[idx + key.len()..];
    // terminate at `;` (next parameter boundary)
    let end = rest.find(';').unwrap_or(rest.len());
    let raw = rest[..end].trim().trim_matches('"');
    if raw.is_empty() {
        None
    } else {
        Some(sanitize(raw))
    }
}

/// Server-supplied names become local path components; neutralize anything
/// that would escape the download directory.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect()
}
