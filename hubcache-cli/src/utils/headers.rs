use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, warn};

/// Parse "Name: Value" strings, skipping malformed ones with a warning
pub fn parse_headers(header_strings: &[String]) -> Vec<(String, String)> {
    header_strings
        .iter()
        .filter_map(|header| parse_header(header))
        .collect()
}

fn parse_header(header_str: &str) -> Option<(String, String)> {
    let Some((name, value)) = header_str.split_once(':') else {
        warn!(header = %header_str, "Invalid header format, expected 'Name: Value'");
        return None;
    };
    let (name, value) = (name.trim(), value.trim());

    if HeaderName::from_bytes(name.as_bytes()).is_err() {
        warn!(name = %name, "Invalid header name");
        return None;
    }
    if HeaderValue::from_str(value).is_err() {
        warn!(name = %name, "Invalid header value");
        return None;
    }

    debug!(name = %name, "Adding header");
    Some((name.to_string(), value.to_string()))
}
