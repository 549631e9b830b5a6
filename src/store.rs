//! On-disk snapshot persistence.
//!
//! Layout, relative to the data directory:
//!
//! ```text
//! guilds_not_discoverable.json          invite codes (input, curated by hand)
//! guild_list.json                       latest snapshot, replaced every cycle
//! collected_data/guild_list_<ts>.json   one file per cycle, ts = %Y%m%d-%H%M
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::types::GuildMap;

pub const SNAPSHOT_DIR: &str = "collected_data";
pub const LATEST_FILE: &str = "guild_list.json";
pub const INVITES_FILE: &str = "guilds_not_discoverable.json";

const SNAPSHOT_PREFIX: &str = "guild_list_";
const SNAPSHOT_SUFFIX: &str = ".json";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
        move |source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where one cycle's snapshot ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub timestamped: PathBuf,
    pub latest: PathBuf,
}

/// A snapshot file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub taken_at: NaiveDateTime,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR)
    }

    pub fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    pub fn invites_path(&self) -> PathBuf {
        self.root.join(INVITES_FILE)
    }

    pub fn snapshot_path(&self, at: NaiveDateTime) -> PathBuf {
        self.snapshot_dir().join(format!(
            "{}{}{}",
            SNAPSHOT_PREFIX,
            at.format(TIMESTAMP_FORMAT),
            SNAPSHOT_SUFFIX
        ))
    }

    /// Persist `guilds` as the snapshot for `at` and as the latest snapshot.
    ///
    /// Both files are staged under a dot-prefixed name and renamed into place,
    /// so readers only ever see complete snapshots.
    pub fn write_snapshot(
        &self,
        guilds: &GuildMap,
        at: NaiveDateTime,
    ) -> Result<SnapshotPaths, StoreError> {
        let dir = self.snapshot_dir();
        fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;

        let timestamped = self.snapshot_path(at);
        write_json_atomic(&timestamped, guilds)?;

        let latest = self.latest_path();
        write_json_atomic(&latest, guilds)?;

        debug!(
            guilds = guilds.len(),
            path = %timestamped.display(),
            "snapshot written"
        );
        Ok(SnapshotPaths {
            timestamped,
            latest,
        })
    }

    /// The hand-curated list of invite codes for guilds that aren't listed in
    /// discovery. A missing file means there are none.
    pub fn load_invite_codes(&self) -> Result<Vec<String>, StoreError> {
        let path = self.invites_path();
        if !path.exists() {
            info!(path = %path.display(), "no invite list found, skipping undiscoverable guilds");
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    /// Every snapshot file with a parseable timestamp, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotFile>, StoreError> {
        let dir = self.snapshot_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).map_err(StoreError::io(&dir))? {
            let entry = entry.map_err(StoreError::io(&dir))?;
            let name = entry.file_name();
            let Some(taken_at) = name.to_str().and_then(parse_snapshot_timestamp) else {
                continue;
            };
            files.push(SnapshotFile {
                taken_at,
                path: entry.path(),
            });
        }
        files.sort_by(|a, b| a.taken_at.cmp(&b.taken_at).then(a.path.cmp(&b.path)));
        Ok(files)
    }

    pub fn load_snapshot(&self, path: &Path) -> Result<GuildMap, StoreError> {
        read_json(path)
    }
}

/// Extract the timestamp from a `guild_list_<ts>.json` file name.
pub fn parse_snapshot_timestamp(file_name: &str) -> Option<NaiveDateTime> {
    let stamp = file_name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(StoreError::json(path))?;
    fs::write(path, bytes).map_err(StoreError::io(path))
}

/// Write next to `path` as `.<name>.tmp`, then rename over `path`.
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = path.with_file_name(format!(".{name}.tmp"));
    write_json(&staging, value)?;
    fs::rename(&staging, path).map_err(StoreError::io(path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(StoreError::io(path))?;
    serde_json::from_slice(&bytes).map_err(StoreError::json(path))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
