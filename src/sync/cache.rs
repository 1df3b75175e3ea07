use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bed::model::{Bed, BedId};
use crate::sync::SyncError;

const CACHE_VERSION: u32 = 1;

/// Durable copy of the whole roster, rewritten after every mutation.
#[derive(Debug, Clone)]
pub struct LocalCache {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    beds: Vec<Bed>,
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    beds: &'a [Bed],
}

impl LocalCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cached roster and fits it to `bed_count` slots numbered from 1.
    /// A missing or unreadable cache yields an all-idle roster.
    pub fn load_roster(&self, bed_count: u32) -> Vec<Bed> {
        let cached = match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<CacheFile>(&text) {
                Ok(file) if file.version == CACHE_VERSION => file.beds,
                Ok(file) => {
                    warn!(
                        path = %self.path.display(),
                        version = file.version,
                        "ignoring bed cache with unsupported version"
                    );
                    Vec::new()
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "ignoring unreadable bed cache");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no bed cache yet, starting with an idle roster");
                Vec::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read bed cache");
                Vec::new()
            }
        };
        fit_roster(cached, bed_count)
    }

    pub fn save(&self, beds: &[Bed]) -> Result<(), SyncError> {
        let payload = CacheFileRef {
            version: CACHE_VERSION,
            beds,
        };
        write_json_atomic(&self.path, &payload, "bed cache")
    }
}

fn fit_roster(cached: Vec<Bed>, bed_count: u32) -> Vec<Bed> {
    (1..=bed_count)
        .map(|id: BedId| {
            cached
                .iter()
                .find(|bed| bed.id == id)
                .cloned()
                .unwrap_or_else(|| Bed::idle(id))
        })
        .collect()
}

/// Writes next to the target and renames over it, so readers never see a torn file.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    what: &'static str,
) -> Result<(), SyncError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|source| SyncError::Encode { what, source })?;
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, format!("{text}\n")).map_err(|source| SyncError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::bed::model::BedStatus;

    #[test]
    fn missing_cache_yields_idle_roster() {
        let dir = tempdir().expect("tempdir");
        let cache = LocalCache::new(dir.path().join("beds.json"));
        let roster = cache.load_roster(4);
        assert_eq!(roster.len(), 4);
        assert_eq!(roster[0].id, 1);
        assert_eq!(roster[3].id, 4);
        assert!(roster.iter().all(|bed| bed.status == BedStatus::Idle));
    }

    #[test]
    fn saved_roster_is_restored() {
        let dir = tempdir().expect("tempdir");
        let cache = LocalCache::new(dir.path().join("beds.json"));
        let mut roster = cache.load_roster(3);
        roster[1].status = BedStatus::Active;
        roster[1].remaining_time = 120;
        roster[1].start_time = Some(1_700_000_000_000);
        cache.save(&roster).expect("save");

        let restored = cache.load_roster(3);
        assert_eq!(restored, roster);
        assert!(!dir.path().join("beds.json.tmp").exists());
    }

    #[test]
    fn roster_is_fitted_to_configured_size() {
        let dir = tempdir().expect("tempdir");
        let cache = LocalCache::new(dir.path().join("beds.json"));
        let mut roster = cache.load_roster(5);
        roster[4].status = BedStatus::Completed;
        cache.save(&roster).expect("save");

        let shrunk = cache.load_roster(3);
        assert_eq!(shrunk.len(), 3);

        let grown = cache.load_roster(7);
        assert_eq!(grown.len(), 7);
        assert_eq!(grown[4].status, BedStatus::Completed);
        assert_eq!(grown[6], Bed::idle(7));
    }

    #[test]
    fn corrupt_cache_falls_back_to_idle_roster() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("beds.json");
        fs::write(&path, "{ definitely not json").expect("write");
        let roster = LocalCache::new(&path).load_roster(2);
        assert_eq!(roster, vec![Bed::idle(1), Bed::idle(2)]);
    }

    #[test]
    fn save_into_missing_directory_reports_io_error() {
        let dir = tempdir().expect("tempdir");
        let cache = LocalCache::new(dir.path().join("missing").join("beds.json"));
        let err = cache.save(&[Bed::idle(1)]).expect_err("should fail");
        assert!(matches!(err, SyncError::Io { .. }));
    }
}
