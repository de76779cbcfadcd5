//! Error normalization
//!
//! Turns an arbitrary failed response body into a `ProviderError` with a
//! readable message. The only envelope assumed is a best-effort
//! `error.message` probe; backends may add extra JSON pointers to try after it.

use serde_json::Value;

use super::http::HttpResponse;
use super::ProviderError;

/// Raw bodies kept on `ProviderError::Api` are cut to this many bytes
const MAX_RAW_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct ErrorNormalizer {
    base_address: String,
    extra_pointers: &'static [&'static str],
}

impl ErrorNormalizer {
    pub fn new(base_address: &str) -> Self {
        Self {
            base_address: base_address.trim_end_matches('/').to_string(),
            extra_pointers: &[],
        }
    }

    /// Additional JSON pointers (e.g. `/error_summary`) tried after `error.message`
    pub fn with_pointers(mut self, pointers: &'static [&'static str]) -> Self {
        self.extra_pointers = pointers;
        self
    }

    pub fn base_address(&self) -> &str {
        &self.base_address
    }

    pub fn fallback_message(&self) -> String {
        format!("The {} server is not available.", self.base_address)
    }

    /// Backend-declared message, if the body carries one
    pub fn extract_message(&self, body: &[u8]) -> Option<String> {
        let json: Value = serde_json::from_slice(body).ok()?;
        std::iter::once("/error/message")
            .chain(self.extra_pointers.iter().copied())
            .filter_map(|pointer| json.pointer(pointer))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|message| !message.is_empty())
            .map(str::to_string)
    }

    /// `Api` error for a failed response, falling back to the server-unavailable message
    pub fn normalize(&self, status: Option<u16>, body: &[u8]) -> ProviderError {
        let message = self
            .extract_message(body)
            .unwrap_or_else(|| self.fallback_message());
        ProviderError::Api {
            status,
            message,
            raw: raw_text(body),
        }
    }

    pub fn from_response(&self, response: &HttpResponse) -> ProviderError {
        self.normalize(Some(response.status), &response.body)
    }

    /// Auth error carrying the server's message when there is one
    pub fn auth_error(&self, response: &HttpResponse) -> ProviderError {
        let message = self
            .extract_message(&response.body)
            .unwrap_or_else(|| format!("The {} server rejected the credentials", self.base_address));
        ProviderError::Auth(message)
    }
}

fn raw_text(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let end = body.len().min(MAX_RAW_BYTES);
    Some(String::from_utf8_lossy(&body[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_error_message() {
        let normalizer = ErrorNormalizer::new("https://docs.example.com/");
        let err = normalizer.normalize(Some(403), br#"{"error":{"message":"Access denied"}}"#);
        assert_eq!(err.message(), "Access denied");
        assert!(matches!(err, ProviderError::Api { status: Some(403), .. }));
        assert!(err.raw_response().unwrap().contains("Access denied"));
    }

    #[test]
    fn test_non_json_falls_back_to_base_address() {
        let normalizer = ErrorNormalizer::new("https://docs.example.com/");
        let err = normalizer.normalize(Some(502), b"<html>Bad Gateway</html>");
        assert_eq!(err.message(), "The https://docs.example.com server is not available.");
    }

    #[test]
    fn test_empty_and_binary_bodies_fall_back() {
        let normalizer = ErrorNormalizer::new("https://cloud.example.org");
        let bodies: [&[u8]; 5] = [b"", &[0xff, 0xfe, 0x00], b"null", b"[1,2]", br#"{"error":"plain"}"#];
        for body in bodies {
            let err = normalizer.normalize(None, body);
            assert!(err.message().contains("https://cloud.example.org"));
        }
    }

    #[test]
    fn test_extra_pointers_after_error_message() {
        let normalizer = ErrorNormalizer::new("https://api.dropboxapi.com")
            .with_pointers(&["/error_summary"]);
        let message = normalizer.extract_message(br#"{"error_summary":"path/not_found/.."}"#);
        assert_eq!(message.as_deref(), Some("path/not_found/.."));

        let both = br#"{"error":{"message":"first"},"error_summary":"second"}"#;
        assert_eq!(normalizer.extract_message(both).as_deref(), Some("first"));
    }

    #[test]
    fn test_blank_message_is_ignored() {
        let normalizer = ErrorNormalizer::new("https://docs.example.com");
        assert_eq!(normalizer.extract_message(br#"{"error":{"message":"  "}}"#), None);
    }

    #[test]
    fn test_raw_body_is_truncated() {
        let normalizer = ErrorNormalizer::new("https://docs.example.com");
        let body = vec![b'x'; MAX_RAW_BYTES * 2];
        let err = normalizer.normalize(Some(500), &body);
        assert_eq!(err.raw_response().map(str::len), Some(MAX_RAW_BYTES));
    }
}
