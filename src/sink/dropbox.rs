//! Dropbox HTTP API v2 client.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use super::cloud::{CloudClient, CloudConnector, FolderStatus};

pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

/// Error bodies longer than this are cut before they reach the log.
const MAX_ERROR_BODY: u64 = 4 * 1024;

/// Builds a [`DropboxClient`] per access token.
#[derive(Clone, Debug)]
pub struct DropboxConnector {
    api_url: String,
    content_url: String,
    timeout: Duration,
}

impl DropboxConnector {
    pub fn new(timeout: Duration) -> Self {
        Self::with_endpoints(DEFAULT_API_URL, DEFAULT_CONTENT_URL, timeout)
    }

    /// Point the client at different hosts (a proxy or a local test server).
    pub fn with_endpoints(api_url: &str, content_url: &str, timeout: Duration) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            content_url: content_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

impl Default for DropboxConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl CloudConnector for DropboxConnector {
    fn connect(&self, token: &str) -> Result<Arc<dyn CloudClient>> {
        if token.trim().is_empty() {
            return Err(anyhow!("dropbox access token is empty"));
        }
        Ok(Arc::new(DropboxClient {
            agent: ureq::AgentBuilder::new().timeout(self.timeout).build(),
            token: token.trim().to_string(),
            api_url: self.api_url.clone(),
            content_url: self.content_url.clone(),
        }))
    }
}

pub struct DropboxClient {
    agent: ureq::Agent,
    token: String,
    api_url: String,
    content_url: String,
}

#[derive(Deserialize)]
struct Account {
    name: AccountName,
}

#[derive(Deserialize)]
struct AccountName {
    display_name: String,
}

impl DropboxClient {
    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl CloudClient for DropboxClient {
    fn account_name(&self) -> Result<String> {
        let url = format!("{}/2/users/get_current_account", self.api_url);
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &self.bearer())
            .call()
            .map_err(|err| api_error("get_current_account", err))?;
        let account: Account = response
            .into_json()
            .context("parse get_current_account response")?;
        Ok(account.name.display_name)
    }

    fn create_folder(&self, path: &str) -> Result<FolderStatus> {
        let url = format!("{}/2/files/create_folder_v2", self.api_url);
        let result = self
            .agent
            .post(&url)
            .set("Authorization", &self.bearer())
            .send_json(json!({ "path": path, "autorename": false }));
        match result {
            Ok(_) => Ok(FolderStatus::Created),
            Err(ureq::Error::Status(409, response)) => {
                let body = read_error_body(response);
                if body.contains("path/conflict") {
                    Ok(FolderStatus::AlreadyExists)
                } else {
                    Err(anyhow!("create_folder_v2 {path}: 409 {body}"))
                }
            }
            Err(err) => Err(api_error("create_folder_v2", err)),
        }
    }

    fn upload(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let url = format!("{}/2/files/upload", self.content_url);
        let arg = json!({
            "path": path,
            "mode": "add",
            "autorename": true,
            "mute": true,
        });
        self.agent
            .post(&url)
            .set("Authorization", &self.bearer())
            .set("Content-Type", "application/octet-stream")
            .set("Dropbox-API-Arg", &arg.to_string())
            .send_bytes(bytes)
            .map_err(|err| api_error("upload", err))?;
        Ok(())
    }
}

fn api_error(endpoint: &str, err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let body = read_error_body(response);
            anyhow!("dropbox {endpoint}: {code} {body}")
        }
        ureq::Error::Transport(transport) => anyhow!("dropbox {endpoint}: {transport}"),
    }
}

fn read_error_body(response: ureq::Response) -> String {
    let mut body = String::new();
    let _ = response
        .into_reader()
        .take(MAX_ERROR_BODY)
        .read_to_string(&mut body);
    body.trim().to_string()
}
