//! REST implementation of [`FhirClient`].
//!
//! The HTTP library is abstracted behind [`HttpClient`] so the REST mapping
//! can be tested without a network. With the `reqwest` feature enabled,
//! [`ReqwestHttpClient`] provides a blocking implementation.

use crate::client::{FhirClient, FhirClientFactory, WriteOutcome};
use crate::configuration::EndpointConfig;
use crate::error::{SyncError, SyncResult};
use crate::version_support::{VersionMap, VersionSupport};
use chrono::{DateTime, Utc};
use fhirsync_protocol::{ExternalResource, FhirVersion, ResourceIdentity, SystemCodeValue};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl HttpMethod {
    fn is_write(self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body, for writes.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header named `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn is_gone(&self) -> bool {
        self.status == 404 || self.status == 410
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// HTTP client abstraction.
///
/// Implementations map connection failures to a retryable
/// [`SyncError::Transport`] and timeouts to [`SyncError::Timeout`]. Any
/// status code, including errors, is a successful `send`.
pub trait HttpClient: Send + Sync {
    /// Sends a request and waits for the response.
    fn send(&self, request: &HttpRequest) -> SyncResult<HttpResponse>;
}

/// FHIR REST client over an [`HttpClient`].
pub struct RestFhirClient<C: HttpClient> {
    base: Url,
    endpoint: EndpointConfig,
    support: Arc<dyn VersionSupport>,
    http: C,
}

impl<C: HttpClient> RestFhirClient<C> {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidConfiguration`] if the base URL cannot be
    /// used as a base.
    pub fn new(
        endpoint: EndpointConfig,
        support: Arc<dyn VersionSupport>,
        http: C,
    ) -> SyncResult<Self> {
        let base = Url::parse(&endpoint.base_url).map_err(|e| {
            SyncError::InvalidConfiguration(format!("base URL {:?}: {e}", endpoint.base_url))
        })?;
        if base.cannot_be_a_base() {
            return Err(SyncError::InvalidConfiguration(format!(
                "base URL {:?} cannot have paths",
                endpoint.base_url
            )));
        }
        Ok(Self {
            base,
            endpoint,
            support,
            http,
        })
    }

    /// Returns the wrapped HTTP client.
    pub fn http(&self) -> &C {
        &self.http
    }

    fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| SyncError::InvalidConfiguration("base URL cannot have paths".into()))?
            .pop_if_empty()
            .extend(segments);
        if self.endpoint.use_json_format {
            url.query_pairs_mut().append_pair("_format", "json");
        }
        Ok(url)
    }

    fn request(&self, method: HttpMethod, url: Url, body: Option<&ExternalResource>) -> SyncResult<HttpRequest> {
        let media_type = self.support.media_type();
        let mut headers = vec![
            ("Accept".to_string(), media_type.to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
        ];
        headers.extend(self.endpoint.headers.iter().cloned());

        let body = match body {
            Some(resource) => {
                headers.push(("Content-Type".to_string(), media_type.to_string()));
                headers.push(("Prefer".to_string(), "return=representation".to_string()));
                Some(serde_json::to_vec(&resource.to_fhir_json()).map_err(|e| {
                    SyncError::Fatal(format!("cannot serialize {}: {e}", resource.resource_type()))
                })?)
            }
            None => None,
        };

        Ok(HttpRequest {
            method,
            url: url.into(),
            headers,
            body,
        })
    }

    fn execute(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        if self.endpoint.log_requests {
            debug!(method = %request.method, url = %request.url, "FHIR request");
        }
        let response = self.http.send(&request)?;
        if self.endpoint.log_requests {
            debug!(
                method = %request.method,
                url = %request.url,
                status = response.status,
                "FHIR response"
            );
        }
        Ok(response)
    }

    fn write(&self, request: HttpRequest, resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        let method = request.method;
        let url = request.url.clone();
        let response = self.execute(request)?;
        if !response.is_success() {
            return Err(status_error(&response, method, &url, resource_label(resource)));
        }
        parse_write_response(&response, resource)
    }
}

impl<C: HttpClient> FhirClient for RestFhirClient<C> {
    fn version(&self) -> FhirVersion {
        self.support.version()
    }

    fn read(&self, resource_type: &str, id: &str) -> SyncResult<Option<ExternalResource>> {
        let url = self.url(&[resource_type, id])?;
        let request = self.request(HttpMethod::Get, url, None)?;
        let url = request.url.clone();
        let response = self.execute(request)?;
        if response.is_gone() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(status_error(
                &response,
                HttpMethod::Get,
                &url,
                format!("{resource_type}/{id}"),
            ));
        }
        Ok(Some(parse_resource(&response.body)?))
    }

    fn search_by_token(
        &self,
        resource_type: &str,
        field: &str,
        token: &SystemCodeValue,
    ) -> SyncResult<Option<ExternalResource>> {
        let mut url = self.url(&[resource_type])?;
        url.query_pairs_mut()
            .append_pair(field, &token.to_string())
            .append_pair("_count", "1");
        let request = self.request(HttpMethod::Get, url, None)?;
        let url = request.url.clone();
        let response = self.execute(request)?;
        if response.is_gone() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(status_error(
                &response,
                HttpMethod::Get,
                &url,
                format!("{resource_type}?{field}={token}"),
            ));
        }
        let bundle: Value = serde_json::from_slice(&response.body)
            .map_err(fhirsync_protocol::ProtocolError::from)?;
        self.support.first_entry(&bundle)
    }

    fn create(&self, resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        // A resource that already carries an id is created under that id.
        let (method, url) = match resource.id() {
            Some(id) => (HttpMethod::Put, self.url(&[resource.resource_type(), id])?),
            None => (HttpMethod::Post, self.url(&[resource.resource_type()])?),
        };
        let mut stripped = resource.clone();
        if method == HttpMethod::Post {
            // Servers reject a stale version on create.
            stripped = ExternalResource::new(resource.resource_type(), resource.to_fhir_json());
            if let Some(body) = stripped.body_mut().as_object_mut() {
                body.remove("meta");
            }
        }
        let request = self.request(method, url, Some(&stripped))?;
        self.write(request, resource)
    }

    fn update(&self, resource: &ExternalResource) -> SyncResult<WriteOutcome> {
        let id = resource.id().ok_or_else(|| {
            SyncError::Fatal(format!("cannot update {} without id", resource.resource_type()))
        })?;
        let url = self.url(&[resource.resource_type(), id])?;
        let mut request = self.request(HttpMethod::Put, url, Some(resource))?;
        if let Some(version) = resource.version() {
            request
                .headers
                .push(("If-Match".to_string(), format!("W/\"{version}\"")));
        }
        self.write(request, resource)
    }

    fn delete(&self, resource_type: &str, id: &str) -> SyncResult<bool> {
        let url = self.url(&[resource_type, id])?;
        let request = self.request(HttpMethod::Delete, url, None)?;
        let url = request.url.clone();
        let response = self.execute(request)?;
        if response.is_gone() {
            return Ok(false);
        }
        if !response.is_success() {
            return Err(status_error(
                &response,
                HttpMethod::Delete,
                &url,
                format!("{resource_type}/{id}"),
            ));
        }
        Ok(true)
    }
}

fn resource_label(resource: &ExternalResource) -> String {
    match resource.id() {
        Some(id) => format!("{}/{id}", resource.resource_type()),
        None => resource.resource_type().to_string(),
    }
}

fn status_error(response: &HttpResponse, method: HttpMethod, url: &str, resource: String) -> SyncError {
    let status = response.status;
    match status {
        412 => SyncError::VersionConflict { resource },
        409 if method.is_write() => SyncError::VersionConflict { resource },
        408 => SyncError::Timeout,
        429 | 500..=599 => {
            SyncError::transport_retryable(format!("{method} {url} returned {status}"))
        }
        _ => {
            let detail = String::from_utf8_lossy(&response.body);
            let detail: String = detail.chars().take(200).collect();
            SyncError::transport_fatal(format!("{method} {url} returned {status}: {detail}"))
        }
    }
}

fn parse_resource(body: &[u8]) -> SyncResult<ExternalResource> {
    let value: Value = serde_json::from_slice(body).map_err(fhirsync_protocol::ProtocolError::from)?;
    Ok(ExternalResource::from_fhir_json(value)?)
}

/// Builds the outcome of a write, from the returned representation if there
/// is one, else from `Location`, `ETag` and `Last-Modified`.
fn parse_write_response(response: &HttpResponse, sent: &ExternalResource) -> SyncResult<WriteOutcome> {
    if !response.body.is_empty() {
        let stored = parse_resource(&response.body)?;
        if let Some(identity) = stored.identity() {
            let last_updated = stored.last_updated();
            return Ok(WriteOutcome::applied(identity, last_updated).with_resource(stored));
        }
    }

    let location = response
        .header("Content-Location")
        .or_else(|| response.header("Location"));
    let (mut id, mut version) = (sent.id().map(str::to_string), None);
    if let Some(location) = location {
        let (path, history) = match location.split_once("/_history/") {
            Some((path, v)) => (path, Some(v.to_string())),
            None => (location, None),
        };
        if let Some(last) = path.rsplit('/').next().filter(|s| !s.is_empty()) {
            id = Some(last.to_string());
        }
        version = history;
    }
    if version.is_none() {
        version = response.header("ETag").map(parse_etag);
    }
    let id = id.ok_or_else(|| {
        SyncError::transport_fatal(format!(
            "write of {} returned no id",
            sent.resource_type()
        ))
    })?;

    let mut identity = ResourceIdentity::new(sent.resource_type(), id);
    identity.version = version;
    let last_updated = response
        .header("Last-Modified")
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|t| t.with_timezone(&Utc));
    Ok(WriteOutcome::applied(identity, last_updated))
}

fn parse_etag(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_string()
}

/// Creates [`RestFhirClient`]s sharing one HTTP client.
pub struct RestClientFactory<C: HttpClient + Clone + 'static> {
    http: C,
    versions: VersionMap,
}

impl<C: HttpClient + Clone + 'static> RestClientFactory<C> {
    /// Creates a factory with the standard version map.
    pub fn new(http: C) -> Self {
        Self {
            http,
            versions: VersionMap::standard(),
        }
    }

    /// Replaces the version map.
    pub fn with_versions(mut self, versions: VersionMap) -> Self {
        self.versions = versions;
        self
    }
}

impl<C: HttpClient + Clone + 'static> FhirClientFactory for RestClientFactory<C> {
    fn create_client(
        &self,
        version: FhirVersion,
        endpoint: &EndpointConfig,
    ) -> SyncResult<Arc<dyn FhirClient>> {
        let support = self.versions.get(version)?;
        Ok(Arc::new(RestFhirClient::new(
            endpoint.clone(),
            support,
            self.http.clone(),
        )?))
    }
}

/// Blocking [`HttpClient`] backed by `reqwest`.
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestHttpClient {
    /// Creates a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a non-retryable transport error if the TLS backend cannot be
    /// initialized.
    pub fn new(timeout: std::time::Duration) -> SyncResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for ReqwestHttpClient {
    fn send(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::transport_retryable(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .map_err(|e| SyncError::transport_retryable(e.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
