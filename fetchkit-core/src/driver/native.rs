//! Native driver over reqwest

use crate::body::RequestBody;
use crate::config::ResolvedRequest;
use crate::driver::Driver;
use crate::error::FetchError;
use crate::response::{decode_body, FetchResponse, ResponseData, ResponseParts, ResponseType};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default user agent, overridable per request or per client.
const USER_AGENT: &str = concat!("fetchkit/", env!("CARGO_PKG_VERSION"));

/// Driver backed by a shared reqwest client with connection pooling.
///
/// Timeouts are enforced here per attempt via the composed cancellation
/// machinery, not via reqwest's own request timeout, so that retry delays
/// and queue waits never count against the attempt budget.
#[derive(Clone)]
pub struct NativeDriver {
    client: Arc<Client>,
}

impl NativeDriver {
    /// Create a driver with default pool settings.
    pub fn new() -> Result<Self, String> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .map_err(|e| format!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Wrap an already-configured reqwest client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    fn build_request(
        &self,
        req: &ResolvedRequest,
        options: &Arc<ResolvedRequest>,
        attempt: u32,
    ) -> Result<reqwest::RequestBuilder, FetchError> {
        let mut header_map = HeaderMap::new();
        for (k, v) in &req.headers {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| {
                FetchError::network(
                    format!("invalid header name '{}': {}", k, e),
                    Arc::clone(options),
                    attempt,
                )
            })?;
            let value = HeaderValue::from_str(v).map_err(|e| {
                FetchError::network(
                    format!("invalid value for header '{}': {}", k, e),
                    Arc::clone(options),
                    attempt,
                )
            })?;
            header_map.insert(name, value);
        }

        // Content-Type is seeded only when the caller has not set one.
        // Multipart is left alone so reqwest can add its boundary.
        if let Some(body) = &req.body {
            if let Some(ct) = body.default_content_type() {
                if !header_map.contains_key(CONTENT_TYPE) {
                    header_map.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
                }
            }
        }

        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .headers(header_map);

        builder = match &req.body {
            None => builder,
            Some(RequestBody::Multipart(parts)) => {
                let mut form = reqwest::multipart::Form::new();
                for part_spec in parts {
                    let mut part = reqwest::multipart::Part::bytes(part_spec.data.to_vec());
                    if let Some(file_name) = &part_spec.file_name {
                        part = part.file_name(file_name.clone());
                    }
                    if let Some(mime) = &part_spec.mime {
                        part = part.mime_str(mime).map_err(|e| {
                            FetchError::network(
                                format!("invalid MIME type '{}': {}", mime, e),
                                Arc::clone(options),
                                attempt,
                            )
                        })?;
                    }
                    form = form.part(part_spec.name.clone(), part);
                }
                builder.multipart(form)
            }
            Some(body) => {
                let encoded = body
                    .encode()
                    .map_err(|m| FetchError::network(m, Arc::clone(options), attempt))?;
                builder.body(encoded)
            }
        };

        Ok(builder)
    }

    fn finish(
        &self,
        req: &ResolvedRequest,
        options: Arc<ResolvedRequest>,
        attempt: u32,
        status: StatusCode,
        headers: HashMap<String, String>,
        bytes: Bytes,
    ) -> Result<FetchResponse, FetchError> {
        let status_code = status.as_u16();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let content_type = headers.get("content-type").cloned();

        if !status.is_success() && !req.ignore_response_error {
            // Error bodies rarely match the caller's directive, so they are
            // decoded with content-type sniffing.
            let data = decode_body(&bytes, content_type.as_deref(), ResponseType::Auto)
                .unwrap_or_else(|_| ResponseData::Bytes(bytes.clone()));
            return Err(FetchError::http(
                status_code,
                status_text,
                data,
                headers,
                options,
                attempt,
            ));
        }

        let data = if let Some(parse) = &req.parse_response {
            let parts = ResponseParts {
                status: status_code,
                status_text: status_text.clone(),
                headers: headers.clone(),
            };
            parse(&bytes, &parts).map_err(|message| {
                FetchError::parse(message, raw_snippet(&bytes), Arc::clone(&options), attempt)
            })?
        } else {
            let directive = if status.is_success() {
                req.response_type
            } else {
                ResponseType::Auto
            };
            decode_body(&bytes, content_type.as_deref(), directive).map_err(|message| {
                FetchError::parse(message, raw_snippet(&bytes), Arc::clone(&options), attempt)
            })?
        };

        Ok(FetchResponse {
            status: status_code,
            status_text,
            headers,
            data,
            hedging: None,
        })
    }
}

#[async_trait]
impl Driver for NativeDriver {
    fn name(&self) -> &str {
        "native"
    }

    async fn perform(
        &self,
        req: &ResolvedRequest,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<FetchResponse, FetchError> {
        let options = Arc::new(req.clone());
        let builder = self.build_request(req, &options, attempt)?;

        if req.verbose {
            debug!("attempt {} -> {} {}", attempt, req.method, req.url);
        }

        let work = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = headers_to_map(response.headers());
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, bytes))
        };

        let sent = tokio::select! {
            result = work => result,
            _ = cancel.cancelled() => {
                return Err(FetchError::abort(None, options, attempt));
            }
            _ = tokio::time::sleep(Duration::from_millis(req.timeout_ms)), if req.timeout_ms > 0 => {
                return Err(FetchError::timeout(req.timeout_ms, options, attempt));
            }
        };

        match sent {
            Ok((status, headers, bytes)) => {
                self.finish(req, options, attempt, status, headers, bytes)
            }
            Err(e) => {
                let message = if e.is_connect() {
                    format!("connection failed: {}", e)
                } else {
                    e.to_string()
                };
                Err(FetchError::network(message, options, attempt).with_cause(Arc::new(e)))
            }
        }
    }
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn raw_snippet(bytes: &Bytes) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        let text = String::from_utf8_lossy(bytes);
        Some(text.chars().take(2048).collect())
    }
}
