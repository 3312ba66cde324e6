//! GitHub App client for driving a `workflow_dispatch` workflow: app
//! authentication, workflow discovery and provisioning, dispatch, run
//! polling and log retrieval.

pub mod api;
pub mod auth;
pub mod clock;
pub mod contents;
pub mod dispatch;
mod error;
pub mod logs;
pub mod orchestrator;
pub mod publish;
pub mod runs;
pub mod webhook;

use std::sync::Arc;

use http::Method;
use indent_core::models::{InstallationId, RepoRef};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use crate::error::{Error, ErrorKind, PublishStep, Result};
use crate::{api::ApiClient, auth::Credentials, clock::Clock};

/// API access as one installation of the app. Cheap to clone; every clone
/// shares the credential cache.
#[derive(Clone)]
pub struct GitHub {
    credentials: Arc<Credentials>,
    installation_id: InstallationId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
    pub default_branch: Option<String>,
    pub html_url: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct PageParams {
    pub per_page: usize,
    pub page: u32,
}

pub(crate) const PER_PAGE: usize = 100;

impl GitHub {
    pub fn new(credentials: Arc<Credentials>, installation_id: InstallationId) -> Self {
        Self { credentials, installation_id }
    }

    pub fn installation_id(&self) -> InstallationId { self.installation_id }

    pub fn credentials(&self) -> &Arc<Credentials> { &self.credentials }

    pub fn clock(&self) -> &dyn Clock { self.credentials.clock().as_ref() }

    fn api(&self) -> &ApiClient { self.credentials.api() }

    async fn request(&self, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let credential = self.credentials.get_installation_credential(self.installation_id).await?;
        self.api().request(method, endpoint, credential.token())
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let builder = self.request(Method::GET, endpoint).await?;
        self.api().send_json(endpoint, builder).await
    }

    pub(crate) async fn get_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        query: &Q,
    ) -> Result<T> {
        let builder = self.request(Method::GET, endpoint).await?.query(query);
        self.api().send_json(endpoint, builder).await
    }

    /// Raw body of a GET, following redirects.
    pub(crate) async fn get_bytes(&self, endpoint: &str) -> Result<Vec<u8>> {
        let builder = self.request(Method::GET, endpoint).await?;
        self.api().send(endpoint, builder).await
    }

    pub(crate) async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let builder = self.request(Method::POST, endpoint).await?.json(body);
        self.api().send_json(endpoint, builder).await
    }

    /// POST for endpoints that answer `204 No Content`.
    pub(crate) async fn post_no_content<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<()> {
        let builder = self.request(Method::POST, endpoint).await?.json(body);
        self.api().send(endpoint, builder).await.map(|_| ())
    }

    pub(crate) async fn delete(&self, endpoint: &str) -> Result<()> {
        let builder = self.request(Method::DELETE, endpoint).await?;
        self.api().send(endpoint, builder).await.map(|_| ())
    }

    /// Collects every page of a list endpoint.
    pub(crate) async fn get_all_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        extra: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut page = 1;
        let mut items = Vec::new();
        loop {
            let builder = self
                .request(Method::GET, endpoint)
                .await?
                .query(extra)
                .query(&PageParams { per_page: PER_PAGE, page });
            let batch: Vec<T> = self.api().send_json(endpoint, builder).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    pub async fn repository(&self, repo: &RepoRef) -> Result<Repository> {
        self.get(&format!("/repos/{}/{}", repo.owner, repo.name)).await
    }
}
