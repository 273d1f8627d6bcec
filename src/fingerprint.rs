// Request fingerprinting: the cache key for a logical request.
//
// The fingerprint is a SHA-256 digest over the method, the URL and the query
// parameters sorted by key (then value), so two requests that differ only in
// parameter order share a cache entry. The digest is base64url-encoded to
// stay printable in logs and in the JSON cache snapshot.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive a fingerprint from a request's identifying parts. Parameter
    /// order is irrelevant; everything else is significant.
    pub fn of(method: &str, url: &str, params: &[(String, String)]) -> Self {
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();

        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        for (k, v) in sorted {
            hasher.update(b"\n");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        Fingerprint(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parameter_order_is_irrelevant() {
        let a = Fingerprint::of(
            "GET",
            "https://api.discogs.com/database/search",
            &pairs(&[("q", "miles davis"), ("type", "artist"), ("page", "2")]),
        );
        let b = Fingerprint::of(
            "GET",
            "https://api.discogs.com/database/search",
            &pairs(&[("page", "2"), ("q", "miles davis"), ("type", "artist")]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn url_and_params_are_significant() {
        let base = Fingerprint::of("GET", "https://x/a", &pairs(&[("q", "foo")]));
        assert_ne!(base, Fingerprint::of("GET", "https://x/b", &pairs(&[("q", "foo")])));
        assert_ne!(base, Fingerprint::of("GET", "https://x/a", &pairs(&[("q", "bar")])));
        assert_ne!(base, Fingerprint::of("GET", "https://x/a", &pairs(&[("q", "foo"), ("page", "2")])));
    }

    #[test]
    fn method_is_case_insensitive() {
        let a = Fingerprint::of("get", "https://x/a", &[]);
        let b = Fingerprint::of("GET", "https://x/a", &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn encoding_is_printable() {
        let fp = Fingerprint::of("GET", "https://x/a", &[]);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
