//! Local image index.
//!
//! The store is laid out as `<root>/<channel>/<version>/` with a fixed set of
//! boot artifacts in every version directory. The filesystem is the source
//! of truth: every scan recomputes the index, and version directories that
//! are incomplete or predate the last format change are removed on sight.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flotilla_proto::ChannelImages;
use semver::Version;

use crate::config::DaemonConfig;
use crate::error::FleetError;
use crate::paths;

/// Channel name to ascending versions.
pub type MediaAssets = BTreeMap<String, Vec<Version>>;

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    channels: Vec<String>,
    artifacts: Vec<String>,
    stale_before: SystemTime,
}

impl ImageStore {
    pub fn new(
        root: impl Into<PathBuf>,
        channels: Vec<String>,
        artifacts: Vec<String>,
        stale_before: SystemTime,
    ) -> Self {
        Self {
            root: root.into(),
            channels,
            artifacts,
            stale_before,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(
            config.store_root(),
            config.channels(),
            config.artifacts(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(config.images.stale_before_unix),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    pub fn version_dir(&self, channel: &str, version: &str) -> PathBuf {
        paths::image_dir(&self.root, channel, version)
    }

    /// Create one directory per known channel.
    pub fn ensure_layout(&self) -> Result<(), FleetError> {
        for channel in &self.channels {
            let dir = self.root.join(channel);
            std::fs::create_dir_all(&dir)
                .map_err(|e| FleetError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    /// Whether every required artifact exists in `dir`.
    pub fn is_complete(&self, dir: &Path) -> bool {
        self.artifacts.iter().all(|a| dir.join(a).is_file())
    }

    /// Rescan the whole store.
    pub fn scan(&self) -> Result<MediaAssets, FleetError> {
        let mut media = MediaAssets::new();
        for channel in &self.channels {
            media.insert(channel.clone(), self.scan_channel(channel)?);
        }
        Ok(media)
    }

    fn scan_channel(&self, channel: &str) -> Result<Vec<Version>, FleetError> {
        let channel_dir = self.root.join(channel);
        let entries = match std::fs::read_dir(&channel_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FleetError::io(
                    format!("reading {}", channel_dir.display()),
                    e,
                ));
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| FleetError::io(format!("reading {}", channel_dir.display()), e))?;
            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|e| FleetError::io(format!("stat {}", path.display()), e))?;
            if !meta.is_dir() {
                continue;
            }

            let Some(version) = entry.file_name().to_str().and_then(|n| Version::parse(n).ok())
            else {
                tracing::debug!(path = %path.display(), "ignoring non-version entry");
                continue;
            };

            let current = meta
                .modified()
                .map(|mtime| mtime > self.stale_before)
                .unwrap_or(false);

            if current && self.is_complete(&path) {
                versions.push(version);
            } else {
                // stale layout or missing artifacts: forces a rebuild on next pull
                tracing::info!(channel, %version, current, "discarding unusable image");
                std::fs::remove_dir_all(&path)
                    .map_err(|e| FleetError::io(format!("removing {}", path.display()), e))?;
            }
        }

        versions.sort();
        Ok(versions)
    }

    /// Delete one version directory.
    pub fn delete_version(&self, channel: &str, version: &Version) -> Result<(), FleetError> {
        let dir = self.version_dir(channel, &version.to_string());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::io(format!("removing {}", dir.display()), e)),
        }
    }
}

/// Drop `channel/version` from a cached index, returning the parsed version.
pub fn take(media: &mut MediaAssets, channel: &str, version: &str) -> Result<Version, FleetError> {
    let not_found = || FleetError::ImageNotFound {
        channel: channel.to_string(),
        version: version.to_string(),
    };
    let versions = media.get_mut(channel).ok_or_else(not_found)?;
    let idx = versions
        .iter()
        .position(|v| v.to_string() == version)
        .ok_or_else(not_found)?;
    Ok(versions.remove(idx))
}

pub fn to_wire(media: &MediaAssets) -> Vec<ChannelImages> {
    media
        .iter()
        .map(|(channel, versions)| ChannelImages {
            channel: channel.clone(),
            versions: versions.iter().map(Version::to_string).collect(),
        })
        .collect()
}
