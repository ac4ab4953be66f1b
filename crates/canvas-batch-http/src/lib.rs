//! HTTP transport for canvas-batch.
//!
//! This is the only crate that knows about `reqwest`: it turns
//! [`HttpRequestSpec`]s into [`RequestDescriptor`]s and maps responses onto
//! [`RequestError`] so the core classifier can decide about retries.

use std::collections::BTreeMap;
use std::str::FromStr;

use canvas_batch_core::{validate_url, BatchError, RequestDescriptor};
use canvas_batch_types::{RequestError, RequestId};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(value: HttpMethod) -> Self {
        match value {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One call of a batch, as read from a request file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: HttpMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl HttpRequestSpec {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            id: None,
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Clone)]
pub struct HttpBatchClient {
    client: reqwest::Client,
    base_url: Url,
    abort: Option<CancellationToken>,
}

impl HttpBatchClient {
    /// `base_url` must pass the URL gate. Headers are sent with every request.
    pub fn new<I, K, V>(base_url: &str, default_headers: I) -> Result<Self, BatchError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let base_url = Url::parse(&validate_url(base_url)?)
            .map_err(|e| BatchError::InvalidUrl(e.to_string()))?;
        let mut headers = HeaderMap::new();
        for (name, value) in default_headers {
            let name = HeaderName::from_str(name.as_ref().trim()).map_err(|e| {
                BatchError::InvalidConfig(format!("bad header name {:?}: {}", name.as_ref(), e))
            })?;
            let mut value = HeaderValue::from_str(value.as_ref().trim()).map_err(|e| {
                BatchError::InvalidConfig(format!("bad value for header {}: {}", name, e))
            })?;
            if name == reqwest::header::AUTHORIZATION {
                value.set_sensitive(true);
            }
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BatchError::InvalidConfig(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url,
            abort: None,
        })
    }

    /// Races every send against `token`; an aborted send fails without a status.
    pub fn with_abort_token(mut self, token: CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base URL. Targets on another origin are refused
    /// so default headers never leave the configured host.
    pub fn resolve(&self, path: &str) -> Result<Url, BatchError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| BatchError::InvalidUrl(format!("{}: {}", path, e)))?;
        if url.origin() != self.base_url.origin() {
            return Err(BatchError::InvalidUrl(format!(
                "{} is outside {}",
                url,
                self.base_url.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    pub fn descriptor(
        &self,
        id: impl Into<RequestId>,
        spec: HttpRequestSpec,
    ) -> Result<RequestDescriptor<Value>, BatchError> {
        let url = self.resolve(&spec.path)?;
        let client = self.client.clone();
        let abort = self.abort.clone();
        let method: reqwest::Method = spec.method.into();
        let body = spec.body;
        Ok(RequestDescriptor::new(id, move || {
            let mut request = client.request(method.clone(), url.clone());
            if let Some(body) = &body {
                request = request.json(body);
            }
            send(request, abort.clone())
        }))
    }

    /// Builds descriptors for a whole request file; entries without an id get
    /// their 1-based position.
    pub fn descriptors(
        &self,
        specs: Vec<HttpRequestSpec>,
    ) -> Result<Vec<RequestDescriptor<Value>>, BatchError> {
        specs
            .into_iter()
            .enumerate()
            .map(|(idx, spec)| {
                let id = spec.id.clone().unwrap_or_else(|| RequestId::from(idx + 1));
                self.descriptor(id, spec)
            })
            .collect()
    }
}

async fn send(
    request: reqwest::RequestBuilder,
    abort: Option<CancellationToken>,
) -> Result<Value, RequestError> {
    let response = match abort {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return Err(RequestError::network("aborted before response")),
            sent = request.send() => sent,
        },
        None => request.send().await,
    };
    let response = response.map_err(transport_error)?;
    into_result(response).await
}

fn transport_error(err: reqwest::Error) -> RequestError {
    if err.is_timeout() {
        RequestError::network(format!("request timed out: {}", err))
    } else {
        RequestError::network(err.to_string())
    }
}

async fn into_result(response: reqwest::Response) -> Result<Value, RequestError> {
    let status = response.status();
    let headers = collect_headers(response.headers());
    let text = response.text().await.map_err(transport_error)?;

    if status.is_success() {
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
    }

    let body = serde_json::from_str::<Value>(&text).ok();
    let errors = body.as_ref().map(errors_from_body).unwrap_or_default();
    let message = body
        .as_ref()
        .and_then(message_from_body)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    tracing::debug!("HTTP {} response: {}", status.as_u16(), message);

    let mut err = RequestError::http(status.as_u16(), message).with_errors(errors);
    for (name, value) in headers {
        err = err.with_header(name, value);
    }
    Err(err)
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
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

/// `errors` of a Canvas error body: `[{"message": ..}]`, `["..."]` or `{"field": ..}`.
pub fn errors_from_body(body: &Value) -> Vec<String> {
    match body.get("errors") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => item
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Some(Value::Object(fields)) => fields
            .iter()
            .flat_map(|(field, detail)| field_messages(field, detail))
            .collect(),
        _ => Vec::new(),
    }
}

fn field_messages(field: &str, detail: &Value) -> Vec<String> {
    match detail {
        Value::String(s) => vec![format!("{}: {}", field, s)],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.get("message")
                    .and_then(Value::as_str)
                    .or_else(|| item.as_str())
                    .map(|m| format!("{}: {}", field, m))
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub fn message_from_body(body: &Value) -> Option<String> {
    ["message", "error", "status"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
