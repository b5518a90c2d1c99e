//! HTTP request step.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::Method;
use tracing::debug;

use crate::scenario::Step;
use crate::{Error, Params, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a response header must look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderExpectation {
    /// Present with any value.
    Any,
    /// Not present.
    Absent,
    /// Present with exactly this value, rendered against the params.
    Exact(String),
}

/// Issue one HTTP request and check the response.
#[derive(Debug, Clone)]
pub struct HttpCall {
    method: Method,
    path: String,
    authority: Option<String>,
    port: Option<u16>,
    body: Option<String>,
    request_headers: Vec<(String, String)>,
    response_code: u16,
    response_body: Option<String>,
    response_headers: Vec<(String, HeaderExpectation)>,
    timeout: Duration,
}

/// `GET` shorthand.
pub type Get = HttpCall;

impl HttpCall {
    /// Request `path` on `ports.client`, expecting a 200.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            authority: None,
            port: None,
            body: None,
            request_headers: Vec::new(),
            response_code: 200,
            response_body: None,
            response_headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// `GET path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Send to `port` instead of `ports.client`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Override the `Host` header.
    pub fn authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Request body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Add a request header. The value is rendered against the params.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    /// Expected status code.
    pub fn expect_status(mut self, code: u16) -> Self {
        self.response_code = code;
        self
    }

    /// Expected body, rendered against the params.
    pub fn expect_body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }

    /// Expectation on a response header.
    pub fn expect_header(mut self, name: impl Into<String>, expectation: HeaderExpectation) -> Self {
        self.response_headers.push((name.into(), expectation));
        self
    }

    /// Request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request_headers(&self, params: &Params, url: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if let Some(authority) = &self.authority {
            let value = HeaderValue::from_str(&params.fill(authority)?)
                .map_err(|e| Error::http(url, e))?;
            headers.insert(HOST, value);
        }
        for (name, value) in &self.request_headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::http(url, e))?;
            let value =
                HeaderValue::from_str(&params.fill(value)?).map_err(|e| Error::http(url, e))?;
            headers.append(name, value);
        }
        Ok(headers)
    }

    fn check_headers(&self, params: &Params, url: &str, headers: &HeaderMap) -> Result<()> {
        for (name, expectation) in &self.response_headers {
            let got = headers.get(name.as_str()).map(|v| v.to_str().unwrap_or_default());
            let failure = match (expectation, got) {
                (HeaderExpectation::Any, None) => Some(format!("missing header {name}")),
                (HeaderExpectation::Absent, Some(value)) => {
                    Some(format!("unexpected header {name}: {value}"))
                }
                (HeaderExpectation::Exact(want), got) => {
                    let want = params.fill(want)?;
                    (got != Some(want.as_str()))
                        .then(|| format!("header {name}: got {got:?}, want {want:?}"))
                }
                _ => None,
            };
            if let Some(message) = failure {
                return Err(Error::http(url, message));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Step for HttpCall {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let port = self.port.unwrap_or(params.ports.client);
        let url = format!("http://127.0.0.1:{port}{}", params.fill(&self.path)?);
        let headers = self.request_headers(params, &url)?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::http(&url, e))?;
        let mut request = client.request(self.method.clone(), &url).headers(headers);
        if let Some(body) = &self.body {
            request = request.body(params.fill(body)?);
        }

        debug!(method = %self.method, url = %url, "sending request");
        let response = request.send().await.map_err(|e| Error::http(&url, e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| Error::http(&url, e))?;

        if status != self.response_code {
            return Err(Error::http(
                &url,
                format!("status {status}, want {}; body: {body}", self.response_code),
            ));
        }
        if let Some(want) = &self.response_body {
            let want = params.fill(want)?;
            if body != want {
                return Err(Error::http(&url, format!("body {body:?}, want {want:?}")));
            }
        }
        self.check_headers(params, &url, &headers)
    }
}
