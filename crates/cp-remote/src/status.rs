//! Cached remote status and upgrade checks
//!
//! Daemon status and remote versions are cached for a short window so that
//! repeated `status`/`list` calls don't each open an ssh connection. The
//! version manifest is cached for much longer. `force` bypasses and refreshes
//! any of them.

use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

use cp_core::cache::TtlCache;
use cp_core::config::RemoteConfig;
use cp_core::error::RemoteError;
use cp_core::{shell, Clock, SshOptions};

use crate::exec::RemoteShell;
use crate::handshake::{self, DaemonStatus};
use crate::probe;
use crate::registry::RegistryEntry;

/// Release manifest published next to the installer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Manifest {
    /// The `version` field, or a version parsed out of `url`
    pub fn effective_version(&self) -> Option<String> {
        self.version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_start_matches('v').to_string())
            .or_else(|| extract_version(&self.url))
    }
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)+)").expect("valid version regex"))
}

/// First dotted version number in `text`
pub fn extract_version(text: &str) -> Option<String> {
    version_pattern().captures(text).map(|c| c[1].to_string())
}

/// Compare dotted versions numerically; missing components count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|part| part.parse().unwrap_or(0)).collect() };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).copied().unwrap_or(0).cmp(&b.get(i).copied().unwrap_or(0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Installed vs published version for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeInfo {
    pub target: String,
    pub current: Option<String>,
    pub latest: Option<String>,
    pub upgrade_available: bool,
}

/// A registry entry together with what we know about it right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetStatus {
    pub entry: RegistryEntry,
    /// `None` when the remote was not contacted
    pub daemon: Option<DaemonStatus>,
    pub tunnel_alive: bool,
}

/// Status, version and manifest lookups behind TTL caches
pub struct StatusChecker {
    shell: RemoteShell,
    remote: RemoteConfig,
    http: reqwest::Client,
    status_cache: TtlCache<String, DaemonStatus>,
    version_cache: TtlCache<String, Option<String>>,
    manifest_cache: TtlCache<String, Manifest>,
}

impl StatusChecker {
    pub fn new(shell: RemoteShell, remote: RemoteConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            status_cache: TtlCache::new(remote.status_ttl, clock.clone()),
            version_cache: TtlCache::new(remote.status_ttl, clock.clone()),
            manifest_cache: TtlCache::new(remote.manifest_ttl, clock),
            http: reqwest::Client::new(),
            shell,
            remote,
        }
    }

    /// Daemon status, from cache when fresh
    ///
    /// Unreachable hosts are a status, not an error.
    pub async fn status(&self, opts: &SshOptions, force: bool) -> Result<DaemonStatus, RemoteError> {
        let key = opts.target.as_str().to_string();
        if !force {
            if let Some(status) = self.status_cache.get_fresh(&key) {
                tracing::trace!(remote = %key, "Status cache hit");
                return Ok(status);
            }
        }

        let status = handshake::daemon_status(&self.shell, opts, &self.remote).await?;
        self.status_cache.insert(key, status.clone());
        Ok(status)
    }

    /// Record a status learned some other way (after start or stop)
    pub fn remember_status(&self, target: &str, status: DaemonStatus) {
        self.status_cache.insert(target.to_string(), status);
    }

    pub fn forget(&self, target: &str) {
        let key = target.to_string();
        self.status_cache.invalidate(&key);
        self.version_cache.invalidate(&key);
    }

    /// Version reported by `<binary> --version` on the target
    pub async fn remote_version(&self, opts: &SshOptions, force: bool) -> Result<Option<String>, RemoteError> {
        let key = opts.target.as_str().to_string();
        if !force {
            if let Some(version) = self.version_cache.get_fresh(&key) {
                return Ok(version);
            }
        }

        let script = format!(
            "b=$(command -v {bin} 2>/dev/null) || b={fallback}; \"$b\" --version 2>/dev/null",
            bin = shell::quote(&self.remote.binary),
            fallback = probe::fallback_binary_path(&self.remote),
        );
        let version = match self.shell.capture(opts, &script, self.remote.probe_timeout).await {
            Ok(output) if output.success() => extract_version(&output.stdout),
            Ok(_) => None,
            Err(RemoteError::Unreachable { message, .. }) => {
                tracing::debug!(remote = %key, "Version check unreachable: {}", message);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.version_cache.insert(key, version.clone());
        Ok(version)
    }

    /// The published manifest (`file://` URLs are read from disk)
    pub async fn manifest(&self, force: bool) -> Result<Manifest, RemoteError> {
        let url = self.remote.manifest_url.clone();
        if !force {
            if let Some(manifest) = self.manifest_cache.get_fresh(&url) {
                return Ok(manifest);
            }
        }

        let parse_error = |message: String| RemoteError::Parse {
            what: format!("manifest {}", url),
            message,
        };
        let manifest: Manifest = if let Some(path) = url.strip_prefix("file://") {
            let body = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&body).map_err(|e| parse_error(e.to_string()))?
        } else {
            tracing::debug!(url = %url, "Fetching version manifest");
            let response = self
                .http
                .get(&url)
                .timeout(self.remote.probe_timeout)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| RemoteError::Unreachable {
                    target: url.clone(),
                    message: e.to_string(),
                })?;
            response.json().await.map_err(|e| parse_error(e.to_string()))?
        };

        self.manifest_cache.insert(url, manifest.clone());
        Ok(manifest)
    }

    /// Compare one target's installed version with the manifest
    pub async fn check_upgrade(&self, opts: &SshOptions, force: bool) -> Result<UpgradeInfo, RemoteError> {
        let latest = self.manifest(force).await?.effective_version();
        self.upgrade_info(opts, latest, force).await
    }

    async fn upgrade_info(&self, opts: &SshOptions, latest: Option<String>, force: bool) -> Result<UpgradeInfo, RemoteError> {
        let current = self.remote_version(opts, force).await?;
        let upgrade_available = match (&current, &latest) {
            (Some(current), Some(latest)) => compare_versions(current, latest) == Ordering::Less,
            _ => false,
        };
        Ok(UpgradeInfo {
            target: opts.target.to_string(),
            current,
            latest,
            upgrade_available,
        })
    }

    /// [`check_upgrade`](Self::check_upgrade) across many targets, at most
    /// `upgrade_concurrency` ssh connections at a time. Results keep the
    /// order of `targets`.
    pub async fn check_many(&self, targets: &[SshOptions], force: bool) -> Result<Vec<Result<UpgradeInfo, RemoteError>>, RemoteError> {
        let latest = self.manifest(force).await?.effective_version();

        let concurrency = self.remote.upgrade_concurrency.max(1);
        let mut results: Vec<(usize, Result<UpgradeInfo, RemoteError>)> = stream::iter(targets.iter().enumerate())
            .map(|(i, opts)| {
                let latest = latest.clone();
                async move { (i, self.upgrade_info(opts, latest, force).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "1.0"), Ordering::Less);
    }

    #[test]
    fn test_manifest_version_field_wins() {
        let manifest = Manifest {
            url: "https://x/cocalc-plus-1.0.0-linux.tar.xz".to_string(),
            sha256: String::new(),
            version: Some("v2.1.0".to_string()),
        };
        assert_eq!(manifest.effective_version().as_deref(), Some("2.1.0"));
    }

    #[test]
    fn test_manifest_version_from_url() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"url": "https://software.cocalc.ai/cocalc-plus/1.4.12/cocalc-plus-linux-x64.tar.xz", "sha256": "ab"}"#,
        )
        .unwrap();
        assert_eq!(manifest.effective_version().as_deref(), Some("1.4.12"));
    }

    #[test]
    fn test_extract_version_from_cli_output() {
        assert_eq!(extract_version("cocalc-plus 0.3.7 (abc123)\n").as_deref(), Some("0.3.7"));
        assert_eq!(extract_version("unknown"), None);
    }
}
