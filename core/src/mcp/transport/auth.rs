//! Credential injection for network bindings
//!
//! Credentials are carried, never negotiated: headers on requests that can
//! carry them, query parameters on the event stream that cannot.

use crate::mcp::config::{AuthConfig, AuthScheme, EndpointConfig};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::Url;

pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Headers implied by the auth scheme
pub fn auth_headers(auth: &AuthConfig) -> Vec<(String, String)> {
    match auth.scheme {
        AuthScheme::None => Vec::new(),
        AuthScheme::Bearer => auth
            .token
            .iter()
            .map(|token| ("Authorization".to_string(), format!("Bearer {token}")))
            .collect(),
        AuthScheme::ApiKey => auth
            .api_key
            .iter()
            .map(|key| {
                let header = auth
                    .header_name
                    .clone()
                    .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string());
                (header, key.clone())
            })
            .collect(),
        AuthScheme::Basic => {
            let user = auth.username.as_deref().unwrap_or_default();
            let pass = auth.password.as_deref().unwrap_or_default();
            if user.is_empty() && pass.is_empty() {
                return Vec::new();
            }
            let encoded = STANDARD.encode(format!("{user}:{pass}"));
            vec![("Authorization".to_string(), format!("Basic {encoded}"))]
        }
    }
}

/// Configured static headers followed by the auth headers
pub fn request_headers(config: &EndpointConfig) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.extend(auth_headers(&config.auth));
    headers
}

/// Put bearer/api-key credentials on a URL as `token` / `api_key`
pub fn apply_query_auth(url: &mut Url, auth: &AuthConfig) {
    match auth.scheme {
        AuthScheme::Bearer => {
            if let Some(token) = &auth.token {
                url.query_pairs_mut().append_pair("token", token);
            }
        }
        AuthScheme::ApiKey => {
            if let Some(key) = &auth.api_key {
                url.query_pairs_mut().append_pair("api_key", key);
            }
        }
        AuthScheme::None | AuthScheme::Basic => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_header() {
        let headers = auth_headers(&AuthConfig::bearer("abc"));
        assert_eq!(headers, vec![("Authorization".into(), "Bearer abc".into())]);
    }

    #[test]
    fn test_api_key_header_defaults_and_overrides() {
        let mut auth = AuthConfig::api_key("k1");
        assert_eq!(auth_headers(&auth)[0].0, "X-API-Key");
        auth.header_name = Some("X-Custom".into());
        assert_eq!(auth_headers(&auth), vec![("X-Custom".into(), "k1".into())]);
    }

    #[test]
    fn test_basic_header_is_base64() {
        let headers = auth_headers(&AuthConfig::basic("user", "pass"));
        assert_eq!(headers[0].1, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_query_auth() {
        let mut url = Url::parse("https://host/sse").unwrap();
        apply_query_auth(&mut url, &AuthConfig::bearer("t 1"));
        assert_eq!(url.as_str(), "https://host/sse?token=t+1");

        let mut url = Url::parse("https://host/sse").unwrap();
        apply_query_auth(&mut url, &AuthConfig::api_key("k"));
        assert_eq!(url.query(), Some("api_key=k"));

        let mut url = Url::parse("https://host/sse").unwrap();
        apply_query_auth(&mut url, &AuthConfig::basic("u", "p"));
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_request_headers_merge_static_and_auth() {
        let mut config = EndpointConfig::sse("x", "https://host").with_auth(AuthConfig::bearer("t"));
        config.headers.insert("X-Trace".into(), "1".into());
        let headers = request_headers(&config);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("X-Trace".into(), "1".into()));
    }
}
