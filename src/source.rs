//! Where raw frames come from.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;
use url::Url;

use crate::settings::SentinelConfig;

/// Responses larger than this are rejected as not being a still image.
pub const MAX_SNAPSHOT_BYTES: u64 = 5 * 1024 * 1024;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub trait FrameSource: Send + Sync {
    /// Fetch one encoded still image for the camera described by `cfg`.
    fn fetch(&self, cfg: &SentinelConfig) -> Result<Vec<u8>>;
}

/// IP cameras exposing `GET /snapshot.cgi?user=..&pwd=..`.
pub struct HttpSnapshotSource {
    agent: ureq::Agent,
}

impl HttpSnapshotSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Default for HttpSnapshotSource {
    fn default() -> Self {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }
}

impl FrameSource for HttpSnapshotSource {
    fn fetch(&self, cfg: &SentinelConfig) -> Result<Vec<u8>> {
        let url = snapshot_url(cfg)?;
        let response = self
            .agent
            .request_url("GET", &url)
            .call()
            .map_err(|err| fetch_error(&url, err))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES + 1)
            .read_to_end(&mut bytes)
            .context("read snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty snapshot"));
        }
        if bytes.len() as u64 > MAX_SNAPSHOT_BYTES {
            return Err(anyhow!(
                "snapshot larger than {} bytes",
                MAX_SNAPSHOT_BYTES
            ));
        }
        Ok(bytes)
    }
}

/// `<origin>snapshot.cgi?user=<user>&pwd=<pass>`
pub fn snapshot_url(cfg: &SentinelConfig) -> Result<Url> {
    let origin = cfg
        .origin
        .as_ref()
        .ok_or_else(|| anyhow!("camera host not configured"))?;
    let mut url = origin.join("snapshot.cgi").context("build snapshot url")?;
    url.query_pairs_mut()
        .append_pair("user", &cfg.settings.user)
        .append_pair("pwd", &cfg.settings.pass);
    Ok(url)
}

/// `ureq::Error` displays the full request URL, query and password included,
/// so only the status code or transport kind and message are kept.
fn fetch_error(url: &Url, err: ureq::Error) -> anyhow::Error {
    let target = format!("{}{}", url.origin().ascii_serialization(), url.path());
    match err {
        ureq::Error::Status(code, _) => {
            anyhow!("fetch snapshot from {}: status code {}", target, code)
        }
        ureq::Error::Transport(transport) => match transport.message() {
            Some(message) => anyhow!(
                "fetch snapshot from {}: {}: {}",
                target,
                transport.kind(),
                message
            ),
            None => anyhow!("fetch snapshot from {}: {}", target, transport.kind()),
        },
    }
}
