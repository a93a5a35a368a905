//! GistStore: `RemoteStore` backed by a private GitHub Gist.
//!
//! The bookmark document is the gist file `bookmarks.md`; the version token
//! is the id of the gist's newest revision (`history[0].version`).
//!
//! The Gist API has no conditional write. `update` compares the head revision
//! with the expected one right before patching, which narrows the window for
//! lost updates but cannot close it.

use async_trait::async_trait;
use bookmark_sync::store::{RemoteDocument, RemoteInfo, RemoteStore, Result, StoreError, Version};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Name of the gist file holding the document.
pub const GIST_FILE: &str = "bookmarks.md";

const USER_AGENT: &str = concat!("bookmarks/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct Gist {
    id: String,
    #[serde(default)]
    files: HashMap<String, GistFile>,
    #[serde(default)]
    history: Vec<GistRevision>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    raw_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GistRevision {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

impl Gist {
    fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| StoreError::Api {
            status: 200,
            message: format!("unexpected gist response: {}", e),
        })
    }

    fn head_version(&self) -> Result<Version> {
        self.history
            .first()
            .map(|rev| Version::new(rev.version.clone()))
            .ok_or_else(|| StoreError::Api {
                status: 200,
                message: format!("gist {} has no revision history", self.id),
            })
    }

    fn document(&self) -> Option<&GistFile> {
        self.files.get(GIST_FILE)
    }
}

/// Map a non-success response to a store error.
fn status_error(status: StatusCode, id: &str, body: &str) -> StoreError {
    if status == StatusCode::NOT_FOUND {
        return StoreError::NotFound(id.to_string());
    }
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    StoreError::Api {
        status: status.as_u16(),
        message,
    }
}

fn network(e: reqwest::Error) -> StoreError {
    StoreError::Network(e.to_string())
}

pub struct GistStore {
    client: Client,
    api_base: String,
}

impl GistStore {
    pub fn new(token: &str, api_base: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            StoreError::Api {
                status: 401,
                message: "token contains invalid characters".into(),
            }
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(network)?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn gist_url(&self, id: &str) -> String {
        format!("{}/gists/{}", self.api_base, id)
    }

    async fn checked(response: Response, id: &str) -> Result<String> {
        let status = response.status();
        let body = response.text().await.map_err(network)?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(status_error(status, id, &body))
        }
    }

    async fn fetch(&self, id: &str) -> Result<Gist> {
        let response = self
            .client
            .get(self.gist_url(id))
            .send()
            .await
            .map_err(network)?;
        Gist::parse(&Self::checked(response, id).await?)
    }

    /// Content of the document file, following `raw_url` when truncated.
    async fn content_of(&self, gist: &Gist) -> Result<String> {
        let Some(file) = gist.document() else {
            warn!("Gist {} has no {}; treating it as empty", gist.id, GIST_FILE);
            return Ok(String::new());
        };
        match (&file.content, file.truncated, &file.raw_url) {
            (_, true, Some(raw_url)) => {
                debug!("Fetching truncated {} from {}", GIST_FILE, raw_url);
                let response = self.client.get(raw_url).send().await.map_err(network)?;
                Self::checked(response, &gist.id).await
            }
            (Some(content), _, _) => Ok(content.clone()),
            (None, _, _) => Ok(String::new()),
        }
    }
}

#[async_trait]
impl RemoteStore for GistStore {
    async fn create(&self, description: &str, content: &str) -> Result<RemoteInfo> {
        let body = json!({
            "description": description,
            "public": false,
            "files": { GIST_FILE: { "content": content } },
        });
        let response = self
            .client
            .post(format!("{}/gists", self.api_base))
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        let gist = Gist::parse(&Self::checked(response, "new gist").await?)?;
        let version = gist.head_version()?;
        debug!("Created gist {} at {}", gist.id, version);
        Ok(RemoteInfo {
            id: gist.id,
            version,
        })
    }

    async fn read(&self, id: &str) -> Result<RemoteDocument> {
        let gist = self.fetch(id).await?;
        Ok(RemoteDocument {
            content: self.content_of(&gist).await?,
            version: gist.head_version()?,
        })
    }

    async fn update(&self, id: &str, content: &str, expected: &Version) -> Result<Version> {
        let actual = self.fetch(id).await?.head_version()?;
        if &actual != expected {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected.clone(),
                actual,
            });
        }

        let body = json!({ "files": { GIST_FILE: { "content": content } } });
        let response = self
            .client
            .patch(self.gist_url(id))
            .json(&body)
            .send()
            .await
            .map_err(network)?;
        Gist::parse(&Self::checked(response, id).await?)?.head_version()
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        match self.fetch(id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn current_version(&self, id: &str) -> Result<Version> {
        self.fetch(id).await?.head_version()
    }
}
