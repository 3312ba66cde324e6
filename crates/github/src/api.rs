use std::time::Duration;

use http::{Method, StatusCode, header};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{Error, Result};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("indent/", env!("CARGO_PKG_VERSION"));

/// Thin REST transport: builds authenticated requests against the API root
/// and turns every response into either a value or a classified [`Error`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: Url) -> Result<Self> {
        // Redirects are followed (log downloads land on a signed URL);
        // reqwest drops the Authorization header when the host changes.
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url { &self.base_url }

    fn url(&self, endpoint: &str) -> Result<Url> {
        let url = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), endpoint);
        Url::parse(&url).map_err(|e| Error::InvalidRequest(format!("Invalid URL {url}: {e}")))
    }

    pub(crate) fn request(
        &self,
        method: Method,
        endpoint: &str,
        bearer: &str,
    ) -> Result<RequestBuilder> {
        Ok(self
            .http
            .request(method, self.url(endpoint)?)
            .header(header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(bearer))
    }

    /// Sends without interpreting the status.
    pub(crate) async fn send_raw(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let response =
            builder.send().await.map_err(|e| Error::from_reqwest(endpoint.to_string(), e))?;
        let status = response.status();
        let body =
            response.bytes().await.map_err(|e| Error::from_reqwest(endpoint.to_string(), e))?;
        tracing::debug!("{} -> {}", endpoint, status);
        Ok((status, body.to_vec()))
    }

    /// Sends and fails on any non-2xx status.
    pub(crate) async fn send(&self, endpoint: &str, builder: RequestBuilder) -> Result<Vec<u8>> {
        let (status, body) = self.send_raw(endpoint, builder).await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(Error::from_status(
                endpoint.to_string(),
                status,
                String::from_utf8_lossy(&body).into_owned(),
            ))
        }
    }

    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> Result<T> {
        let body = self.send(endpoint, builder).await?;
        decode(endpoint, &body)
    }
}

pub(crate) fn decode<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|source| Error::Decode {
        endpoint: endpoint.to_string(),
        source,
    })
}
