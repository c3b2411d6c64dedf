//! Response representation and body decoding

use crate::hedge::HedgeOutcome;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How a response body should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    /// Inspect `Content-Type`: JSON for `application/json*`, text for
    /// `text/*`, raw bytes for everything else.
    Auto,
    /// Always decode as JSON.
    Json,
    /// Always decode as text.
    Text,
    /// Raw bytes.
    Blob,
    /// Raw bytes.
    ArrayBuffer,
    /// Raw bytes. Streaming with backpressure is out of scope, so the full
    /// body is read.
    Stream,
    /// Read as text; no XML parsing is done by the driver.
    Xml,
    /// Read as text.
    Html,
    /// Read as text, one JSON document per line; the driver does not split.
    Ndjson,
}

impl Default for ResponseType {
    fn default() -> Self {
        Self::Auto
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    Empty,
}

impl ResponseData {
    /// The decoded JSON value, if this body is JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The decoded text, if this body is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The raw bytes, if this body was read as bytes.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Status line and headers of a raw response, handed to custom decoders.
#[derive(Debug, Clone)]
pub struct ResponseParts {
    pub status: u16,
    pub status_text: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
}

/// A completed HTTP response with its decoded body.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,

    /// HTTP status text.
    pub status_text: String,

    /// Response headers; names are lowercased.
    pub headers: HashMap<String, String>,

    /// Decoded body.
    pub data: ResponseData,

    /// Present when the response was produced by a hedged call.
    pub hedging: Option<HedgeOutcome>,
}

impl FetchResponse {
    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Look up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Deserialize the JSON body into a typed value.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            ResponseData::Json(v) => serde_json::from_value(v.clone()),
            ResponseData::Text(s) => serde_json::from_str(s),
            ResponseData::Bytes(b) => serde_json::from_slice(b),
            ResponseData::Empty => serde_json::from_str("null"),
        }
    }
}

/// Decode a raw body according to the response-type directive.
///
/// Returns the decode failure message on error; the caller wraps it into the
/// error taxonomy together with the raw body.
pub(crate) fn decode_body(
    bytes: &Bytes,
    content_type: Option<&str>,
    directive: ResponseType,
) -> Result<ResponseData, String> {
    if bytes.is_empty() {
        return Ok(ResponseData::Empty);
    }

    match directive {
        ResponseType::Auto => {
            let ct = content_type.unwrap_or("").to_ascii_lowercase();
            if ct.starts_with("application/json") || ct.contains("+json") {
                decode_json(bytes)
            } else if ct.starts_with("text/") {
                Ok(ResponseData::Text(decode_text(bytes)))
            } else {
                Ok(ResponseData::Bytes(bytes.clone()))
            }
        }
        ResponseType::Json => decode_json(bytes),
        ResponseType::Text | ResponseType::Xml | ResponseType::Html | ResponseType::Ndjson => {
            Ok(ResponseData::Text(decode_text(bytes)))
        }
        ResponseType::Blob | ResponseType::ArrayBuffer | ResponseType::Stream => {
            Ok(ResponseData::Bytes(bytes.clone()))
        }
    }
}

fn decode_json(bytes: &Bytes) -> Result<ResponseData, String> {
    serde_json::from_slice(bytes)
        .map(ResponseData::Json)
        .map_err(|e| format!("invalid JSON: {}", e))
}

fn decode_text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
