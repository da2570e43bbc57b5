//! Log redaction helpers

/// Hide the left half of a secret, keeping the right half for correlation
pub fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => String::new(),
        1 => "X".to_string(),
        n => {
            let right: String = chars[n / 2..].iter().collect();
            format!("{}{}", "X".repeat(10), right)
        }
    }
}

/// Replace any `access_token` query value in `uri` with `REDACTED`
pub fn sanitize_query(uri: &str) -> String {
    let (path, query) = match uri.split_once('?') {
        Some(parts) => parts,
        None => return uri.to_string(),
    };
    let pairs: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if key == "access_token" && !value.is_empty() => {
                "access_token=REDACTED".to_string()
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{}?{}", path, pairs.join("&"))
}
