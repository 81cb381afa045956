//! Websocket scheme inference.
//!
//! Behind a TLS-terminating proxy the request itself looks like plain HTTP,
//! so the scheme is read from the browser's `Origin` header instead.

/// Decides whether a browser reached us over `wss` or `ws`.
pub trait SchemeInference: Send + Sync + 'static {
    fn websocket_scheme(&self, origin: Option<&str>) -> &'static str;
}

/// `wss` when the origin is `https`, `ws` otherwise.
#[derive(Debug, Clone)]
pub struct OriginSchemeInference {
    missing_origin: String,
}

impl OriginSchemeInference {
    /// `missing_origin` stands in for the header when a request has none.
    pub fn new(missing_origin: impl Into<String>) -> Self {
        Self {
            missing_origin: missing_origin.into(),
        }
    }
}

impl Default for OriginSchemeInference {
    fn default() -> Self {
        Self::new("https")
    }
}

impl SchemeInference for OriginSchemeInference {
    fn websocket_scheme(&self, origin: Option<&str>) -> &'static str {
        let origin = origin.unwrap_or(&self.missing_origin);
        if origin.starts_with("https") {
            "wss"
        } else {
            "ws"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_decides_scheme() {
        let inference = OriginSchemeInference::default();
        assert_eq!(inference.websocket_scheme(Some("https://example.org")), "wss");
        assert_eq!(inference.websocket_scheme(Some("http://localhost:8080")), "ws");
        assert_eq!(inference.websocket_scheme(None), "wss");
    }

    #[test]
    fn missing_origin_default_is_configurable() {
        let inference = OriginSchemeInference::new("http");
        assert_eq!(inference.websocket_scheme(None), "ws");
    }
}
