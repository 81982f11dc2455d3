//! Minimal Elasticsearch REST client: base URL, optional basic auth, status checks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Characters left as-is inside a single path segment (document ids).
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

const ERROR_EXCERPT_LEN: usize = 500;

#[derive(Clone)]
struct BasicAuth {
    user: Arc<str>,
    pass: Arc<str>,
}

#[derive(Clone)]
pub struct EsHttp {
    client: Client,
    base_url: Arc<str>,
    auth: Option<BasicAuth>,
}

impl EsHttp {
    /// Basic auth is sent only when `user` is non-empty.
    pub fn new(
        base_url: impl Into<Arc<str>>,
        user: impl Into<Arc<str>>,
        pass: impl Into<Arc<str>>,
        timeout: Duration,
        gzip: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .gzip(gzip)
            .build()
            .context("building es http client")?;
        let user: Arc<str> = user.into();
        let auth = (!user.trim().is_empty()).then(|| BasicAuth {
            user,
            pass: pass.into(),
        });
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            auth,
        })
    }

    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{path}", self.base_url)
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        if let Some(auth) = &self.auth {
            builder.basic_auth(&*auth.user, Some(&*auth.pass))
        } else {
            builder
        }
    }

    /// Send and return the response if its status is in `accepted` or 2xx.
    /// Any other status becomes an error carrying an excerpt of the body.
    pub async fn send(
        &self,
        builder: RequestBuilder,
        what: &'static str,
        accepted: &[StatusCode],
    ) -> Result<Response> {
        let resp = builder.send().await.with_context(|| format!("{what}: request"))?;
        let status = resp.status();
        if status.is_success() || accepted.contains(&status) {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{what}: http {status}: {}", excerpt(&body, ERROR_EXCERPT_LEN));
    }

    /// `HEAD` a path: `Ok(true)` on 2xx, `Ok(false)` on 404.
    pub async fn exists(&self, path: &str, what: &'static str) -> Result<bool> {
        let resp = self
            .send(self.request(Method::HEAD, path), what, &[StatusCode::NOT_FOUND])
            .await?;
        Ok(resp.status().is_success())
    }

    /// Send a JSON body and decode a JSON response.
    pub async fn call_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        what: &'static str,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .send(self.request(method, path).json(body), what, &[])
            .await?;
        resp.json()
            .await
            .with_context(|| format!("{what}: decoding response"))
    }
}

/// Percent-encode a value for use as one URL path segment.
pub fn encode_path_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

pub fn normalize_base_url(base_url: impl Into<Arc<str>>) -> Arc<str> {
    let raw: Arc<str> = base_url.into();
    if !raw.ends_with('/') {
        return raw;
    }
    raw.trim_end_matches('/').into()
}

fn excerpt(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut cut = limit;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &body[..cut])
}
