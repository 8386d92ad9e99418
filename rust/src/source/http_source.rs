use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::{FetchRequest, FetchResponse, NetworkSource};

/// Headers that describe a single hop and must not be forwarded in either direction.
const HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_request(&self, request: &FetchRequest) -> RequestBuilder {
        let mut req = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(forwardable_headers(&request.headers));
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }
        req
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_hop_header(name: &str) -> bool {
    HOP_HEADERS.contains(&name)
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_header(name.as_str()) || name.as_str().starts_with("x-client-") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_header(name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[async_trait]
impl NetworkSource for HttpSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let resp = self.build_request(request).send().await?;

        let status = resp.status();
        debug!(
            "http fetch method={} url={} status={}",
            request.method,
            request.url,
            status.as_u16()
        );
        if status.is_server_error() {
            warn!("http fetch upstream error status={} url={}", status.as_u16(), request.url);
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let headers = end_to_end_headers(resp.headers());
        let body = resp.bytes().await?;
        Ok(FetchResponse {
            status: status.as_u16(),
            content_type,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_hop_headers_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("127.0.0.1:1234"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("x-client-session", HeaderValue::from_static("3"));

        let out = forwardable_headers(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_response_hop_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("cache-control", HeaderValue::from_static("no-store"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let out = end_to_end_headers(&headers);
        assert!(out.get("transfer-encoding").is_none());
        assert_eq!(out.get("cache-control").unwrap(), "no-store");
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
    }
}
