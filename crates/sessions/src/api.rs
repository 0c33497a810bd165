/// Client for the backend's session REST endpoints.
use std::time::Duration;

use {
    anyhow::Context,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use tether_config::ServerConfig;

const SESSIONS_PATH: &str = "/agents/api/sessions/";

/// A session as described by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<String>,
}

fn default_active() -> bool {
    true
}

/// The external collaborator that lists and creates sessions.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<RemoteSession>>;
    async fn create(&self, name: &str) -> anyhow::Result<RemoteSession>;
}

/// `reqwest`-backed [`SessionApi`].
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
}

/// The list endpoint returns a bare array, or a page when pagination is on.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Page { results: Vec<RemoteSession> },
    Bare(Vec<RemoteSession>),
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        Self::new(config.base_url.clone(), config.http_timeout())
    }

    fn endpoint(&self) -> String {
        format!("{}{SESSIONS_PATH}", self.base_url)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn list(&self) -> anyhow::Result<Vec<RemoteSession>> {
        let url = self.endpoint();
        debug!(url = %url, "listing sessions");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .json::<ListResponse>()
            .await
            .context("invalid session list")?;

        Ok(match resp {
            ListResponse::Page { results } => results,
            ListResponse::Bare(sessions) => sessions,
        })
    }

    async fn create(&self, name: &str) -> anyhow::Result<RemoteSession> {
        let url = self.endpoint();
        debug!(url = %url, name, "creating session");
        let session = self
            .client
            .post(&url)
            .json(&CreateRequest { name })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()?
            .json::<RemoteSession>()
            .await
            .context("invalid created session")?;
        Ok(session)
    }
}
