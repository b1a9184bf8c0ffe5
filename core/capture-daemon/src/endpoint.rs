//! Endpoint canonicalization.
//!
//! Collapses literal URLs into the *shape* of the interaction so the dedup
//! ledger counts distinct endpoints rather than distinct requests: identifier
//! path segments become placeholders and query values are dropped, keeping only
//! the sorted set of parameter names.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use url::Url;

pub const ID_PLACEHOLDER: &str = "{id}";
pub const UUID_PLACEHOLDER: &str = "{uuid}";
pub const OBJECT_ID_PLACEHOLDER: &str = "{objectid}";
pub const VALUE_PLACEHOLDER: &str = "{value}";

static RE_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});
static RE_OBJECT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[0-9a-f]{24}$").unwrap());

/// Normalized path + query-key string. Computed once per finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointSignature(String);

impl EndpointSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dedup key used by the session ledger.
    pub fn dedup_key(&self, method: &str) -> String {
        format!("{}:{}", method.to_ascii_uppercase(), self.0)
    }
}

impl fmt::Display for EndpointSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<EndpointSignature> for String {
    fn from(signature: EndpointSignature) -> String {
        signature.0
    }
}

/// Total: never fails, falls back to the raw string when `raw` is not a URL.
pub fn canonicalize(raw: &str) -> EndpointSignature {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => return EndpointSignature(raw.to_string()),
    };

    let mut signature = canonical_path(url.path());

    let names: BTreeSet<String> = url
        .query_pairs()
        .map(|(name, _)| name.into_owned())
        .filter(|name| !name.is_empty())
        .collect();
    if !names.is_empty() {
        let query = names
            .iter()
            .map(|name| format!("{}={}", name, VALUE_PLACEHOLDER))
            .collect::<Vec<_>>()
            .join("&");
        signature.push('?');
        signature.push_str(&query);
    }

    EndpointSignature(signature)
}

fn canonical_path(path: &str) -> String {
    path.split('/')
        .map(canonical_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_segment(segment: &str) -> &str {
    if RE_NUMERIC.is_match(segment) {
        ID_PLACEHOLDER
    } else if RE_UUID.is_match(segment) {
        UUID_PLACEHOLDER
    } else if RE_OBJECT_ID.is_match(segment) {
        OBJECT_ID_PLACEHOLDER
    } else {
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_collapse() {
        let a = canonicalize("https://example.com/users/42/profile");
        let b = canonicalize("https://example.com/users/99/profile");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "/users/{id}/profile");
    }

    #[test]
    fn different_resources_stay_distinct() {
        let users = canonicalize("https://example.com/users/42");
        let orders = canonicalize("https://example.com/orders/42");
        assert_ne!(users, orders);
    }

    #[test]
    fn uuid_and_object_id_segments() {
        let signature = canonicalize(
            "https://example.com/docs/3F2504E0-4F89-11D3-9A0C-0305E82C3301/rev/507f1f77bcf86cd799439011",
        );
        assert_eq!(signature.as_str(), "/docs/{uuid}/rev/{objectid}");
    }

    #[test]
    fn mixed_segments_are_kept() {
        let signature = canonicalize("https://example.com/v2/item42/abc");
        assert_eq!(signature.as_str(), "/v2/item42/abc");
    }

    #[test]
    fn query_values_collapse_but_names_do_not() {
        let a = canonicalize("https://example.com/search?a=1&b=2");
        let b = canonicalize("https://example.com/search?b=9&a=9");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "/search?a={value}&b={value}");

        let narrow = canonicalize("https://example.com/search?a=1");
        let wide = canonicalize("https://example.com/search?a=1&c=1");
        assert_ne!(narrow, wide);
    }

    #[test]
    fn repeated_query_names_count_once() {
        let signature = canonicalize("https://example.com/f?tag=x&tag=y");
        assert_eq!(signature.as_str(), "/f?tag={value}");
    }

    #[test]
    fn empty_query_is_ignored() {
        let signature = canonicalize("https://example.com/path?");
        assert_eq!(signature.as_str(), "/path");
    }

    #[test]
    fn unparseable_url_falls_back_to_raw() {
        let signature = canonicalize("not a url");
        assert_eq!(signature.as_str(), "not a url");
    }

    #[test]
    fn dedup_key_includes_method() {
        let signature = canonicalize("https://example.com/api/items/7");
        assert_eq!(signature.dedup_key("post"), "POST:/api/items/{id}");
    }
}
