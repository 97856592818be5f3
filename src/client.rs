//! Typed HTTP client for the meshmon daemon REST API.

use anyhow::{bail, Context, Result};
use reqwest::Client;

use crate::api::rest::DaemonHealth;
use crate::domain::events::Notification;
use crate::domain::registry::{Highscore, NodeLookup, StatusSummary};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9280";

pub struct MeshmonClient {
    base_url: String,
    http: Client,
}

impl MeshmonClient {
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            http,
        })
    }

    pub async fn health(&self) -> Result<DaemonHealth> {
        self.get("/health").await
    }

    pub async fn status(&self) -> Result<StatusSummary> {
        self.get("/api/v1/status").await
    }

    pub async fn node(&self, name: &str) -> Result<NodeLookup> {
        self.get(&format!("/api/v1/nodes/{}", name)).await
    }

    pub async fn highscores(&self) -> Result<Vec<Highscore>> {
        self.get("/api/v1/highscores").await
    }

    pub async fn events(&self) -> Result<Vec<Notification>> {
        self.get("/api/v1/events").await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if !resp.status().is_success() {
            bail!("{} returned {}", url, resp.status());
        }

        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", url))
    }
}
