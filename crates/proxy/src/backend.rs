//! Backend clients: thin wrappers over each upstream's native API exposing
//! one uniform operation: open a streaming chat completion and yield typed
//! chunks.

pub(crate) mod anthropic;
pub(crate) mod cluster;
pub(crate) mod openai;

use async_trait::async_trait;
use axum::http::HeaderMap;
use secrecy::SecretString;

use crate::chunk::ChunkStream;
use crate::error::ProxyResult;
use crate::messages::anthropic::MessagesRequest;

/// Header carrying the client's Anthropic API key, forwarded to backends
/// that want it.
const API_KEY_HEADER: &str = "x-api-key";

/// Runtime context for one proxied request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// API key forwarded from the client, overriding the configured one.
    pub api_key: Option<SecretString>,
}

/// Extract the request context from the incoming headers. Clients send
/// either `x-api-key` (Anthropic convention) or a bearer token; both pass
/// through to the backend untouched.
pub fn extract_context(headers: &HeaderMap) -> RequestContext {
    let api_key = headers
        .get(API_KEY_HEADER)
        .or_else(|| headers.get(axum::http::header::AUTHORIZATION))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value))
        .map(|key| SecretString::from(key.to_string()));

    RequestContext { api_key }
}

/// Uniform interface over the concrete backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Open a streaming completion upstream. The returned stream yields
    /// typed chunks; dropping it closes the upstream socket, which is how
    /// cancellation reaches the backend.
    async fn open_stream(&self, request: &MessagesRequest, context: &RequestContext) -> ProxyResult<ChunkStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use secrecy::ExposeSecret;

    #[test]
    fn extracts_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-123"));

        let context = extract_context(&headers);
        assert_eq!(context.api_key.unwrap().expose_secret(), "sk-ant-123");
    }

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-1"));

        let context = extract_context(&headers);
        assert_eq!(context.api_key.unwrap().expose_secret(), "tok-1");
    }

    #[test]
    fn missing_credentials_are_fine() {
        assert!(extract_context(&HeaderMap::new()).api_key.is_none());
    }
}
