use axum::http::{header, HeaderMap, HeaderValue};
use std::time::Duration;

/// HTTP caching directives for served derivatives.
///
/// A derivative's bytes are a pure function of the URL and the negotiated
/// format, so shared caches may keep it as long as the server does. The
/// `Accept` header picks the format, hence `Vary: Accept` on every response.
#[derive(Clone, Debug)]
pub struct CachePolicy {
    /// Browser and shared cache time-to-live in seconds.
    pub max_age: u64,

    /// Enable public caching by intermediaries (CDNs, proxies).
    pub public: bool,

    /// Serve stale content while revalidating in background (stale-while-revalidate).
    pub stale_while_revalidate: Option<u64>,
}

impl CachePolicy {
    /// Lets clients keep a derivative for as long as the janitor would.
    pub fn for_derivatives(retention: Duration) -> Self {
        Self {
            max_age: retention.as_secs(),
            public: true,
            stale_while_revalidate: Some(60),
        }
    }

    /// Creates configuration that completely bypasses all caching layers.
    pub fn no_cache() -> Self {
        Self { max_age: 0, public: false, stale_while_revalidate: None }
    }

    /// Generates the Cache-Control header value.
    pub fn cache_control_value(&self) -> String {
        if self.max_age == 0 {
            return "no-store, no-cache, must-revalidate".to_string();
        }

        let mut parts = Vec::new();
        parts.push(if self.public { "public" } else { "private" }.to_string());
        parts.push(format!("max-age={}", self.max_age));

        if let Some(seconds) = self.stale_while_revalidate {
            parts.push(format!("stale-while-revalidate={}", seconds));
        }

        parts.join(", ")
    }

    /// Writes `Cache-Control` and `Vary: Accept` into `headers`.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.cache_control_value()) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        headers.insert(header::VARY, HeaderValue::from_static("Accept"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivative_cache_control() {
        let value = CachePolicy::for_derivatives(Duration::from_secs(3600)).cache_control_value();
        assert_eq!(value, "public, max-age=3600, stale-while-revalidate=60");
    }

    #[test]
    fn test_no_cache() {
        let value = CachePolicy::no_cache().cache_control_value();
        assert_eq!(value, "no-store, no-cache, must-revalidate");
    }

    #[test]
    fn test_apply_sets_vary() {
        let mut headers = HeaderMap::new();
        CachePolicy::for_derivatives(Duration::from_secs(60)).apply(&mut headers);
        assert_eq!(headers[header::VARY], "Accept");
        assert!(headers.contains_key(header::CACHE_CONTROL));
    }
}
