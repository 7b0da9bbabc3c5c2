// HTTP request and response types

use crate::ApiError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A fully buffered request as seen by handlers.
///
/// Header names are stored lowercase.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            path_params: HashMap::new(),
            query_params: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse the request body as JSON
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::BadRequest(e.to_string()))
    }

    /// Like [`json`](Self::json), but an empty body yields `T::default()`.
    pub fn json_or_default<T: for<'de> Deserialize<'de> + Default>(&self) -> Result<T, ApiError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        self.json()
    }

    pub fn param(&self, name: &str) -> Option<&String> {
        self.path_params.get(name)
    }

    pub fn query(&self, name: &str) -> Option<&String> {
        self.query_params.get(name)
    }

    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(&name.to_ascii_lowercase())
    }

    /// Token of an `Authorization: Bearer <token>` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }
}

/// Response produced by handlers.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn created() -> Self {
        Self::new(201)
    }

    pub fn accepted() -> Self {
        Self::new(202)
    }

    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, ApiError> {
        self.body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(self)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Deserialize the body; used by tests and clients of the router.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        let req = HttpRequest::new("GET", "/").with_header("Authorization", "Bearer s3cret");
        assert_eq!(req.bearer_token(), Some("s3cret"));

        let req = HttpRequest::new("GET", "/").with_header("authorization", "bearer  s3cret ");
        assert_eq!(req.bearer_token(), Some("s3cret"));

        let req = HttpRequest::new("GET", "/").with_header("Authorization", "Basic abc");
        assert_eq!(req.bearer_token(), None);

        let req = HttpRequest::new("GET", "/").with_header("Authorization", "Bearer ");
        assert_eq!(req.bearer_token(), None);

        assert_eq!(HttpRequest::new("GET", "/").bearer_token(), None);
    }

    #[test]
    fn test_json_or_default_on_empty_body() {
        #[derive(Deserialize, Default, Debug, PartialEq)]
        struct Body {
            value: Option<u32>,
        }

        let req = HttpRequest::new("POST", "/");
        assert_eq!(req.json_or_default::<Body>().unwrap(), Body::default());

        let req = HttpRequest::new("POST", "/").with_body(r#"{"value": 3}"#);
        assert_eq!(req.json_or_default::<Body>().unwrap().value, Some(3));

        let req = HttpRequest::new("POST", "/").with_body("{");
        assert!(matches!(req.json_or_default::<Body>(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_with_json_sets_content_type() {
        let response = HttpResponse::created()
            .with_json(&serde_json::json!({"id": 1}))
            .unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["id"], 1);
    }
}
