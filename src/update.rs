use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DeskError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct UpdateStatus {
    pub(crate) current: String,
    pub(crate) latest: String,
    pub(crate) update_available: bool,
}

pub(crate) trait UpdateChecker: Send + Sync {
    fn check(&self) -> Result<UpdateStatus, DeskError>;
}

#[derive(Debug, Deserialize)]
struct GitHubReleasePayload {
    tag_name: String,
}

/// Reads `tag_name` from a GitHub "latest release" endpoint.
pub(crate) struct GitHubReleaseChecker {
    release_url: String,
    current_version: String,
    timeout: Duration,
    system_proxy: bool,
}

impl GitHubReleaseChecker {
    pub(crate) fn new(release_url: &str) -> Self {
        Self {
            release_url: release_url.trim().to_string(),
            current_version: normalize_version_tag(env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(10),
            system_proxy: true,
        }
    }

    fn fetch_latest_release_tag(&self) -> Result<String, DeskError> {
        let mut builder = reqwest::blocking::Client::builder().timeout(self.timeout);
        if !self.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        let response = client
            .get(&self.release_url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("geminidesk/", env!("CARGO_PKG_VERSION")))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DeskError::UpdateCheckFailed(format!(
                "HTTP {} {}",
                status,
                body.trim()
            )));
        }
        let payload: GitHubReleasePayload = response.json()?;
        Ok(normalize_version_tag(&payload.tag_name))
    }
}

impl UpdateChecker for GitHubReleaseChecker {
    fn check(&self) -> Result<UpdateStatus, DeskError> {
        if self.release_url.is_empty() {
            return Err(DeskError::UpdateCheckFailed(
                "no release feed configured".to_string(),
            ));
        }
        let latest = self.fetch_latest_release_tag().map_err(|err| match err {
            DeskError::UpdateCheckFailed(_) => err,
            other => DeskError::UpdateCheckFailed(other.to_string()),
        })?;
        let update_available = compare_version_tags(
            latest.trim_start_matches('v'),
            self.current_version.trim_start_matches('v'),
        ) == Ordering::Greater;
        Ok(UpdateStatus {
            current: self.current_version.clone(),
            latest,
            update_available,
        })
    }
}

/// Background form used after startup: the outcome is only logged.
pub(crate) fn check_and_log(checker: &dyn UpdateChecker) {
    match checker.check() {
        Ok(status) if status.update_available => log::info!(
            "update available: {} (running {})",
            status.latest,
            status.current
        ),
        Ok(status) => log::info!("up to date ({})", status.current),
        Err(DeskError::UpdateCheckFailed(reason)) if reason == "no release feed configured" => {
            log::info!("update check skipped: {reason}")
        }
        Err(err) => log::warn!("{err}"),
    }
}

pub(crate) fn normalize_version_tag(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('v') {
        trimmed.to_string()
    } else {
        format!("v{trimmed}")
    }
}

fn parse_version_key(version_tag: &str) -> Option<Vec<u64>> {
    let mut values = Vec::new();
    for part in version_tag.split('.') {
        values.push(part.parse::<u64>().ok()?);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

pub(crate) fn compare_version_tags(a: &str, b: &str) -> Ordering {
    match (parse_version_key(a), parse_version_key(b)) {
        (Some(left), Some(right)) => left.cmp(&right),
        _ => a.cmp(b),
    }
}
