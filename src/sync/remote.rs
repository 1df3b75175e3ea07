use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::bed::model::{BedId, BedPatch, PatientVisit, VisitPatch};
use crate::sync::cache::write_json_atomic;
use crate::sync::{SyncError, SyncStatus, VisitLog};
use crate::time_provider::TimeProvider;

pub const REMOTE_QUEUE_CAPACITY: usize = 256;
const WORKER_POLL: Duration = Duration::from_millis(200);

/// Authoritative shared store. Bed rows are only ever patched, never removed.
pub trait RemoteStore: Send {
    fn update_bed(&mut self, bed_id: BedId, patch: &BedPatch, stamp: i64) -> Result<(), SyncError>;
    fn insert_visit(&mut self, visit: &PatientVisit) -> Result<String, SyncError>;
    fn update_visit(&mut self, bed_id: BedId, patch: &VisitPatch) -> Result<(), SyncError>;
}

/// Remote tables kept as JSON files in a directory shared between stations.
pub struct TableDirStore {
    dir: PathBuf,
    clock: Arc<dyn TimeProvider>,
    visit_seq: u64,
}

impl TableDirStore {
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn TimeProvider>) -> Result<Self, SyncError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| SyncError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            clock,
            visit_seq: 0,
        })
    }

    pub fn beds_path(&self) -> PathBuf {
        self.dir.join("beds.json")
    }

    pub fn visits_path(&self) -> PathBuf {
        self.dir.join("visits.json")
    }
}

impl RemoteStore for TableDirStore {
    fn update_bed(&mut self, bed_id: BedId, patch: &BedPatch, stamp: i64) -> Result<(), SyncError> {
        let path = self.beds_path();
        let mut table = match read_table(&path)? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(SyncError::Malformed {
                    path,
                    reason: "expected an object keyed by bed id".to_string(),
                });
            }
            None => Map::new(),
        };

        let row = table
            .entry(bed_id.to_string())
            .or_insert_with(|| json!({ "id": bed_id }));
        let Value::Object(row) = row else {
            return Err(SyncError::Malformed {
                path,
                reason: format!("row for bed {bed_id} is not an object"),
            });
        };
        merge_fields(row, patch, "bed patch")?;
        row.insert("last_update_timestamp".to_string(), json!(stamp));

        write_json_atomic(&path, &Value::Object(table), "beds table")
    }

    fn insert_visit(&mut self, visit: &PatientVisit) -> Result<String, SyncError> {
        let path = self.visits_path();
        let mut rows = read_rows(&path)?;

        self.visit_seq += 1;
        let id = format!("visit-{}-{}", self.clock.now_ms(), self.visit_seq);
        let mut stored = visit.clone();
        stored.id = Some(id.clone());
        let value = serde_json::to_value(&stored).map_err(|source| SyncError::Encode {
            what: "visit",
            source,
        })?;
        rows.push(value);

        write_json_atomic(&path, &rows, "visits table")?;
        Ok(id)
    }

    fn update_visit(&mut self, bed_id: BedId, patch: &VisitPatch) -> Result<(), SyncError> {
        let path = self.visits_path();
        let mut rows = read_rows(&path)?;

        let latest = rows
            .iter_mut()
            .rev()
            .find(|row| row.get("bed_id").and_then(Value::as_u64) == Some(u64::from(bed_id)));
        let Some(Value::Object(row)) = latest else {
            debug!(bed_id, "no visit row for bed, skipping visit update");
            return Ok(());
        };
        merge_fields(row, patch, "visit patch")?;

        write_json_atomic(&path, &rows, "visits table")
    }
}

fn merge_fields<T: serde::Serialize>(
    row: &mut Map<String, Value>,
    patch: &T,
    what: &'static str,
) -> Result<(), SyncError> {
    let value = serde_json::to_value(patch).map_err(|source| SyncError::Encode { what, source })?;
    if let Value::Object(fields) = value {
        for (key, field) in fields {
            row.insert(key, field);
        }
    }
    Ok(())
}

fn read_table(path: &Path) -> Result<Option<Value>, SyncError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SyncError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|err| SyncError::Malformed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn read_rows(path: &Path) -> Result<Vec<Value>, SyncError> {
    match read_table(path)? {
        Some(Value::Array(rows)) => Ok(rows),
        Some(_) => Err(SyncError::Malformed {
            path: path.to_path_buf(),
            reason: "expected an array of visit rows".to_string(),
        }),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone)]
pub enum RemoteJob {
    UpdateBed {
        bed_id: BedId,
        patch: BedPatch,
        stamp: i64,
    },
    InsertVisit(PatientVisit),
    UpdateVisit {
        bed_id: BedId,
        patch: VisitPatch,
    },
}

/// Cloneable submit side of the remote worker.
#[derive(Clone)]
pub struct RemoteHandle {
    sender: SyncSender<RemoteJob>,
    status: Arc<Mutex<SyncStatus>>,
}

impl RemoteHandle {
    /// Never blocks: a full queue drops the job.
    pub fn submit(&self, job: RemoteJob) -> Result<(), SyncError> {
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => SyncError::QueueFull,
            TrySendError::Disconnected(_) => SyncError::WorkerStopped,
        })
    }

    pub fn status(&self) -> SyncStatus {
        self.status
            .lock()
            .map(|guard| *guard)
            .unwrap_or(SyncStatus::Degraded)
    }
}

pub struct RemoteWorker {
    handle: RemoteHandle,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RemoteWorker {
    pub fn spawn(store: Box<dyn RemoteStore>) -> Self {
        let (sender, receiver) = mpsc::sync_channel(REMOTE_QUEUE_CAPACITY);
        let status = Arc::new(Mutex::new(SyncStatus::Online));
        let stop = Arc::new(AtomicBool::new(false));
        let status_for_thread = Arc::clone(&status);
        let stop_for_thread = Arc::clone(&stop);
        let join = thread::spawn(move || {
            run_remote_loop(store, receiver, status_for_thread, stop_for_thread)
        });
        info!("remote persistence worker started");
        Self {
            handle: RemoteHandle { sender, status },
            stop,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> &RemoteHandle {
        &self.handle
    }
}

impl Drop for RemoteWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_remote_loop(
    mut store: Box<dyn RemoteStore>,
    receiver: Receiver<RemoteJob>,
    status: Arc<Mutex<SyncStatus>>,
    stop: Arc<AtomicBool>,
) {
    loop {
        match receiver.recv_timeout(WORKER_POLL) {
            Ok(job) => {
                let outcome = execute_job(store.as_mut(), job);
                let next = if outcome { SyncStatus::Online } else { SyncStatus::Degraded };
                if let Ok(mut guard) = status.lock() {
                    *guard = next;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn execute_job(store: &mut dyn RemoteStore, job: RemoteJob) -> bool {
    let result = match &job {
        RemoteJob::UpdateBed {
            bed_id,
            patch,
            stamp,
        } => store.update_bed(*bed_id, patch, *stamp),
        RemoteJob::InsertVisit(visit) => store.insert_visit(visit).map(|id| {
            debug!(visit_id = %id, bed_id = ?visit.bed_id, "visit recorded remotely");
        }),
        RemoteJob::UpdateVisit { bed_id, patch } => store.update_visit(*bed_id, patch),
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, job = ?job, "remote write failed");
            false
        }
    }
}

/// Visit log backed by the remote worker queue.
pub struct RemoteVisitLog {
    handle: RemoteHandle,
}

impl RemoteVisitLog {
    pub fn new(handle: RemoteHandle) -> Self {
        Self { handle }
    }
}

impl VisitLog for RemoteVisitLog {
    fn add_visit(&self, visit: PatientVisit) {
        if let Err(err) = self.handle.submit(RemoteJob::InsertVisit(visit)) {
            warn!(error = %err, "visit insert not queued");
        }
    }

    fn update_visit(&self, bed_id: BedId, patch: VisitPatch) {
        if let Err(err) = self.handle.submit(RemoteJob::UpdateVisit { bed_id, patch }) {
            warn!(bed_id, error = %err, "visit update not queued");
        }
    }
}
