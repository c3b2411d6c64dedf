//! Request body kinds and their wire encoding

use bytes::Bytes;
use serde_json::Value;

/// A request body in one of the shapes the client accepts.
///
/// Structured values are JSON-serialized, form maps are URL-encoded, and
/// multipart parts are handed to the transport so it can pick its own
/// boundary. Strings and byte buffers pass through unchanged.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Raw text, sent as-is.
    Text(String),

    /// Raw bytes, sent as-is.
    Bytes(Bytes),

    /// A structured value, serialized as JSON.
    Json(Value),

    /// Key/value pairs, URL-encoded as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),

    /// Multipart form data.
    Multipart(Vec<MultipartPart>),
}

/// One part of a multipart body.
#[derive(Debug, Clone)]
pub struct MultipartPart {
    /// Field name.
    pub name: String,

    /// Optional file name for file parts.
    pub file_name: Option<String>,

    /// Optional MIME type for the part.
    pub mime: Option<String>,

    /// Part contents.
    pub data: Bytes,
}

impl MultipartPart {
    /// Create a plain text field part.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            mime: None,
            data: Bytes::from(value.into()),
        }
    }

    /// Create a file part with a file name.
    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: Some(file_name.into()),
            mime: None,
            data: data.into(),
        }
    }

    /// Set the MIME type for this part.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

impl RequestBody {
    /// The `Content-Type` seeded for this body when the caller has not set
    /// one. Multipart returns `None` so the transport can set its own
    /// boundary parameter.
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Self::Json(_) => Some("application/json"),
            Self::Form(_) => Some("application/x-www-form-urlencoded"),
            Self::Text(_) | Self::Bytes(_) | Self::Multipart(_) => None,
        }
    }

    /// Encode this body as raw bytes for the wire.
    ///
    /// Multipart bodies are not encodable here; the driver builds the
    /// transport's own multipart form for them.
    pub fn encode(&self) -> Result<Bytes, String> {
        match self {
            Self::Text(s) => Ok(Bytes::from(s.clone())),
            Self::Bytes(b) => Ok(b.clone()),
            Self::Json(v) => serde_json::to_vec(v)
                .map(Bytes::from)
                .map_err(|e| format!("failed to serialize JSON body: {}", e)),
            Self::Form(pairs) => {
                let mut encoder = url::form_urlencoded::Serializer::new(String::new());
                for (k, v) in pairs {
                    encoder.append_pair(k, v);
                }
                Ok(Bytes::from(encoder.finish()))
            }
            Self::Multipart(_) => Err("multipart bodies are encoded by the driver".to_string()),
        }
    }

    /// A stable fingerprint of the body used for dedup and debounce keys.
    ///
    /// JSON bodies serialize with sorted keys (serde_json's default map is
    /// ordered), so structurally equal values produce equal fingerprints.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Text(s) => format!("text:{}", s),
            Self::Bytes(b) => format!("bytes:{}:{:x?}", b.len(), b.as_ref().iter().take(32).collect::<Vec<_>>()),
            Self::Json(v) => format!("json:{}", v),
            Self::Form(pairs) => {
                let mut sorted: Vec<_> = pairs.iter().collect();
                sorted.sort();
                format!("form:{:?}", sorted)
            }
            Self::Multipart(parts) => {
                let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
                format!("multipart:{}:{:?}", parts.len(), names)
            }
        }
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Value> for RequestBody {
    fn from(v: Value) -> Self {
        Self::Json(v)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<(String, String)>> for RequestBody {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self::Form(pairs)
    }
}

impl From<Vec<MultipartPart>> for RequestBody {
    fn from(parts: Vec<MultipartPart>) -> Self {
        Self::Multipart(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_body_content_type() {
        let body = RequestBody::Json(json!({"a": 1}));
        assert_eq!(body.default_content_type(), Some("application/json"));
    }

    #[test]
    fn test_form_body_encoding() {
        let body = RequestBody::Form(vec![
            ("q".to_string(), "hello world".to_string()),
            ("page".to_string(), "2".to_string()),
        ]);
        assert_eq!(
            body.default_content_type(),
            Some("application/x-www-form-urlencoded")
        );
        let encoded = body.encode().unwrap();
        assert_eq!(&encoded[..], b"q=hello+world&page=2");
    }

    #[test]
    fn test_text_body_passthrough() {
        let body = RequestBody::from("plain");
        assert!(body.default_content_type().is_none());
        assert_eq!(&body.encode().unwrap()[..], b"plain");
    }

    #[test]
    fn test_json_fingerprint_is_key_order_independent() {
        let a = RequestBody::Json(json!({"b": 2, "a": 1}));
        let b = RequestBody::Json(json!({"a": 1, "b": 2}));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_multipart_not_encodable_directly() {
        let body = RequestBody::Multipart(vec![MultipartPart::text("field", "value")]);
        assert!(body.encode().is_err());
    }
}
