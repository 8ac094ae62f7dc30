//! # Envelope Module
//!
//! RAGFlow response envelope.
//!
//! Every RAGFlow JSON endpoint answers `{"code": 0, "data": ...}` on success
//! and `{"code": <n>, "message": "..."}` on failure, usually with HTTP 200.
//! [`decode`] turns that into an [`ApiResult`] so callers never poke at
//! optional fields by hand.

use serde::de::DeserializeOwned;
use serde::Deserialize;

// =============================================================================
// API RESULT
// =============================================================================
/// Outcome of decoding one RAGFlow response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult<T> {
    /// `code == 0` and `data` has the expected shape
    Success(T),
    /// `code != 0`
    Error { code: i64, message: String },
    /// Not an envelope, or `data` did not match `T`
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

// =============================================================================
// DECODING
// =============================================================================
/// Decode a response body into an [`ApiResult`].
pub fn decode<T: DeserializeOwned>(body: &str) -> ApiResult<T> {
    let raw: RawEnvelope = match serde_json::from_str(body) {
        Ok(raw) => raw,
        Err(e) => return ApiResult::Malformed(format!("not a RAGFlow envelope: {}", e)),
    };

    if raw.code != 0 {
        return ApiResult::Error {
            code: raw.code,
            message: raw.message.unwrap_or_else(|| "no message".to_string()),
        };
    }

    match serde_json::from_value(raw.data) {
        Ok(data) => ApiResult::Success(data),
        Err(e) => ApiResult::Malformed(format!("unexpected data shape: {}", e)),
    }
}
