//! Authentication headers for completion requests

/// Attach the bearer credential to an outgoing request.
///
/// An empty key sends no `Authorization` header at all, which lets local
/// OpenAI-compatible servers that need no credential work unchanged.
pub fn add_auth_headers(request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        return request;
    }
    request.header("Authorization", format!("Bearer {api_key}"))
}
