//! Request Adapter
//!
//! Builds `HttpRequest`s from a `RequestSpec`: base address + percent-encoded
//! path + parameters (query, JSON body or form body). Encoding problems are
//! reported as `ProviderError::Encoding` before anything touches the network.
//! Also validates responses: status class, JSON content type and the optional
//! `{"response": ...}` envelope.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

use super::http::{HttpRequest, HttpResponse};
use super::normalize::ErrorNormalizer;
use super::ProviderError;

/// How `RequestSpec::params` travel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamEncoding {
    Query,
    Json,
    Form,
}

/// Where the payload sits in a successful JSON response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// Payload is the whole body
    TopLevel,
    /// Payload is wrapped as `{"response": <payload>}`
    Response,
}

/// Immutable description of one API call
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Encoded path relative to the base address, or an absolute URL
    pub path: String,
    pub params: Map<String, Value>,
    pub encoding: ParamEncoding,
    pub headers: Vec<(String, String)>,
    /// Raw body; takes precedence over body-encoded params
    pub body: Option<Vec<u8>>,
}

impl RequestSpec {
    /// Spec for a literal, already-encoded path
    pub fn new(method: Method, path: &str) -> Self {
        let encoding = if method == Method::GET || method == Method::DELETE {
            ParamEncoding::Query
        } else {
            ParamEncoding::Json
        };
        Self {
            method,
            path: path.to_string(),
            params: Map::new(),
            encoding,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Spec for a path template whose `{}` placeholders are filled with encoded `args`
    pub fn templated(method: Method, template: &str, args: &[&str]) -> Result<Self, ProviderError> {
        Ok(Self::new(method, &fill_template(template, args)?))
    }

    pub fn get(path: &str) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: &str) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn encoding(mut self, encoding: ParamEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json_body(self, value: &Value) -> Result<Self, ProviderError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ProviderError::Encoding(format!("Request body: {}", e)))?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }
}

/// Percent-encode one path segment.
///
/// Empty, `.` and `..` segments cannot be represented: URL normalization
/// would silently retarget the request.
pub fn encode_segment(segment: &str) -> Result<String, ProviderError> {
    if segment.is_empty() {
        return Err(ProviderError::Encoding("Empty path segment".to_string()));
    }
    if segment == "." || segment == ".." {
        return Err(ProviderError::Encoding(format!("Relative path segment '{}'", segment)));
    }
    if segment.contains('\0') {
        return Err(ProviderError::Encoding("Path segment contains a NUL byte".to_string()));
    }
    Ok(urlencoding::encode(segment).into_owned())
}

pub fn decode_segment(segment: &str) -> Result<String, ProviderError> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|e| ProviderError::Encoding(format!("Invalid percent-encoding: {}", e)))
}

/// Percent-encode each segment of a `/`-separated path, keeping the separators
pub fn encode_path(path: &str) -> Result<String, ProviderError> {
    let leading = path.starts_with('/');
    let trailing = path.len() > 1 && path.ends_with('/');
    let inner = path.trim_matches('/');
    if inner.is_empty() {
        return Ok(if leading { "/".to_string() } else { String::new() });
    }
    let encoded = inner
        .split('/')
        .map(encode_segment)
        .collect::<Result<Vec<_>, _>>()?
        .join("/");
    Ok(format!(
        "{}{}{}",
        if leading { "/" } else { "" },
        encoded,
        if trailing { "/" } else { "" }
    ))
}

pub fn decode_path(path: &str) -> Result<String, ProviderError> {
    Ok(path
        .split('/')
        .map(decode_segment)
        .collect::<Result<Vec<_>, _>>()?
        .join("/"))
}

fn fill_template(template: &str, args: &[&str]) -> Result<String, ProviderError> {
    let placeholders = template.matches("{}").count();
    if placeholders != args.len() {
        return Err(ProviderError::Encoding(format!(
            "Path template '{}' expects {} argument(s), got {}",
            template,
            placeholders,
            args.len()
        )));
    }
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    for arg in args {
        // placeholder count checked above
        let Some((head, tail)) = rest.split_once("{}") else {
            break;
        };
        out.push_str(head);
        out.push_str(&encode_segment(arg)?);
        rest = tail;
    }
    out.push_str(rest);
    Ok(out)
}

fn param_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Arrays go out as repeated `key[]` pairs
fn append_param<T: url::form_urlencoded::Target>(
    serializer: &mut url::form_urlencoded::Serializer<'_, T>,
    key: &str,
    value: &Value,
) {
    match value {
        Value::Array(items) => {
            let key = format!("{}[]", key);
            for item in items {
                serializer.append_pair(&key, &param_to_string(item));
            }
        }
        other => {
            serializer.append_pair(key, &param_to_string(other));
        }
    }
}

/// Builds requests for one base address
#[derive(Debug, Clone)]
pub struct RequestAdapter {
    base: Url,
    timeout: Duration,
    /// Other hosts of the same backend that also receive the credential
    trusted: Vec<Url>,
}

impl RequestAdapter {
    pub fn new(base_address: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let mut normalized = base_address.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized)
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid server address '{}': {}", base_address, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ProviderError::InvalidConfig(format!(
                "Unsupported scheme '{}' in server address",
                base.scheme()
            )));
        }
        Ok(Self { base, timeout, trusted: Vec::new() })
    }

    /// Also send the credential to `address` (e.g. a separate content host)
    pub fn trusting(mut self, address: &str) -> Result<Self, ProviderError> {
        let url = Url::parse(address)
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid server address '{}': {}", address, e)))?;
        self.trusted.push(url);
        Ok(self)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URL for an encoded path or an absolute link
    pub fn resolve(&self, path: &str) -> Result<Url, ProviderError> {
        if path.starts_with("https://") || path.starts_with("http://") {
            return Url::parse(path).map_err(|e| ProviderError::Encoding(format!("{}: {}", path, e)));
        }
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ProviderError::Encoding(format!("{}: {}", path, e)))
    }

    /// Build the request without credentials; `authorize` adds them
    pub fn build(&self, spec: &RequestSpec) -> Result<HttpRequest, ProviderError> {
        let mut url = self.resolve(&spec.path)?;
        let mut request_body = spec.body.clone();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if !spec.params.is_empty() {
            match spec.encoding {
                ParamEncoding::Query => {
                    let mut pairs = url.query_pairs_mut();
                    for (key, value) in &spec.params {
                        append_param(&mut pairs, key, value);
                    }
                }
                ParamEncoding::Json if request_body.is_none() => {
                    let body = serde_json::to_vec(&spec.params)
                        .map_err(|e| ProviderError::Encoding(format!("Request parameters: {}", e)))?;
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    request_body = Some(body);
                }
                ParamEncoding::Form if request_body.is_none() => {
                    let mut form = url::form_urlencoded::Serializer::new(String::new());
                    for (key, value) in &spec.params {
                        append_param(&mut form, key, value);
                    }
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                    request_body = Some(form.finish().into_bytes());
                }
                _ => {
                    return Err(ProviderError::Encoding(
                        "Parameters cannot be sent in the body alongside a raw body".to_string(),
                    ))
                }
            }
        }

        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ProviderError::Encoding(format!("Header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ProviderError::Encoding(format!("Header '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        let mut request = HttpRequest::new(spec.method.clone(), url, self.timeout);
        request.headers = headers;
        request.body = request_body;
        Ok(request)
    }

    /// Only hosts under this base receive the credential
    pub fn is_own_host(&self, url: &Url) -> bool {
        std::iter::once(&self.base)
            .chain(self.trusted.iter())
            .any(|own| url.host_str() == own.host_str() && url.port_or_known_default() == own.port_or_known_default())
    }

    /// Attach the `Authorization` header when the request targets our own host
    pub fn authorize(&self, request: &mut HttpRequest, header: Option<HeaderValue>) {
        match header {
            Some(value) if self.is_own_host(&request.url) => {
                request.headers.insert(AUTHORIZATION, value);
            }
            _ => {
                request.headers.remove(AUTHORIZATION);
            }
        }
    }
}

/// `application/json`, or any `+json` media type, ignoring parameters
pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(value) = content_type else {
        return false;
    };
    let essence = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json") || essence == "text/json"
}

/// Validate a response and return its JSON payload.
///
/// Non-2xx responses go through the normalizer. A 2xx response with a
/// non-JSON content type is a `Validation` error and its body is not parsed.
pub fn decode_json(
    response: &HttpResponse,
    envelope: Envelope,
    normalizer: &ErrorNormalizer,
) -> Result<Value, ProviderError> {
    if !response.is_success() {
        return Err(normalizer.from_response(response));
    }
    if response.status == 204 || response.body.is_empty() {
        return Ok(Value::Null);
    }
    if !is_json_content_type(response.content_type()) {
        return Err(ProviderError::Validation(format!(
            "Expected JSON from {} but received '{}'",
            normalizer.base_address(),
            response.content_type().unwrap_or("no content type")
        )));
    }
    let json: Value = serde_json::from_slice(&response.body)
        .map_err(|e| ProviderError::Validation(format!("Malformed JSON: {}", e)))?;

    match envelope {
        Envelope::TopLevel => Ok(json),
        Envelope::Response => {
            if json.pointer("/error/message").is_some() {
                return Err(normalizer.normalize(Some(response.status), &response.body));
            }
            match json {
                Value::Object(mut map) => map
                    .remove("response")
                    .ok_or_else(|| ProviderError::Validation("Missing response envelope".to_string())),
                _ => Err(ProviderError::Validation("Missing response envelope".to_string())),
            }
        }
    }
}
