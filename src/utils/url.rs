use anyhow::{Context, Result};
use reqwest::Url;

/// Decode an `application/x-www-form-urlencoded` fragment into key/value pairs.
/// A leading `#` is ignored.
/// Example: "access_token=abc&expires_in=3600" -> [("access_token", "abc"), ("expires_in", "3600")]
pub fn fragment_params(fragment: &str) -> Vec<(String, String)> {
    let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
    let Ok(mut carrier) = Url::parse("http://fragment.invalid/") else {
        return Vec::new();
    };
    carrier.set_query(Some(fragment));
    carrier
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// First value for `name` in a fragment, if present.
pub fn fragment_param(fragment: &str, name: &str) -> Option<String> {
    fragment_params(fragment)
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

/// Build `base?k=v&...` with form-encoded values.
pub fn with_query(base: &str, params: &[(&str, &str)]) -> Result<Url> {
    Url::parse_with_params(base, params).with_context(|| format!("invalid base url {}", base))
}
