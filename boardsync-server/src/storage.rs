//! Durable op log and snapshot storage.
//!
//! The [`Storage`] trait is the contract the sequencer needs from a backing
//! store: append-with-unique-key, point lookup by `op_id`, ordered range scan,
//! and snapshot upsert. Two implementations are provided:
//!
//! - [`MemoryStorage`]: everything in process memory, for tests and
//!   single-process deployments that do not need to survive restarts.
//! - [`FileStorage`]: one directory per workspace holding a JSON-lines op log
//!   and a snapshot file replaced atomically via rename.
//!
//! Uniqueness of `op_id` is scoped to a workspace.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use boardsync_proto::op::{LogEntry, Snapshot};
use parking_lot::Mutex;

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("storage I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A persisted record could not be decoded.
    #[error("corrupt record in {path} line {line}: {reason}")]
    Corrupt {
        /// File containing the record.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Decoder message.
        reason: String,
    },
    /// A record could not be encoded.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    /// The caller tried to append a sequence that is not past the log head.
    #[error("sequence {seq} is not after log head {head}")]
    OutOfOrder {
        /// Sequence offered.
        seq: u64,
        /// Current highest sequence.
        head: u64,
    },
}

/// Result of appending a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry was stored under its sequence.
    Inserted,
    /// An entry with the same `op_id` already exists at this sequence.
    Duplicate(u64),
}

/// Backing store for per-workspace op logs and snapshots.
///
/// Calls for the same workspace are serialized by that workspace's sequencer;
/// implementations only need to be safe across workspaces.
pub trait Storage: Send + Sync {
    /// Appends `entry` unless its `op_id` is already present.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the entry could not be made durable.
    fn insert_entry(&self, workspace: &str, entry: &LogEntry) -> Result<InsertOutcome, StorageError>;

    /// Looks up an entry by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the log could not be read.
    fn entry_by_op_id(&self, workspace: &str, op_id: &str)
    -> Result<Option<LogEntry>, StorageError>;

    /// Returns up to `limit` entries with `seq > since`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the log could not be read.
    fn entries_after(
        &self,
        workspace: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError>;

    /// Highest stored sequence, 0 for an empty log.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the log could not be read.
    fn max_seq(&self, workspace: &str) -> Result<u64, StorageError>;

    /// Latest snapshot, or the empty snapshot at sequence 0.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the snapshot exists but could not be read.
    fn load_snapshot(&self, workspace: &str) -> Result<Snapshot, StorageError>;

    /// Replaces the workspace snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the snapshot could not be written.
    fn save_snapshot(&self, workspace: &str, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Whether calls may block the thread on I/O. Sequencers move such
    /// calls off the async worker.
    fn blocks_on_io(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Shared in-memory log index
// ---------------------------------------------------------------------------

/// Ordered entries plus the `op_id` index for one workspace.
#[derive(Debug, Default)]
struct WorkspaceLog {
    entries: Vec<LogEntry>,
    by_op_id: HashMap<String, u64>,
    snapshot: Option<Snapshot>,
}

impl WorkspaceLog {
    fn head(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.seq)
    }

    /// Checks uniqueness and ordering without mutating.
    fn check(&self, entry: &LogEntry) -> Result<Option<u64>, StorageError> {
        if let Some(seq) = self.by_op_id.get(&entry.op.op_id) {
            return Ok(Some(*seq));
        }
        let head = self.head();
        if entry.seq <= head {
            return Err(StorageError::OutOfOrder {
                seq: entry.seq,
                head,
            });
        }
        Ok(None)
    }

    fn push(&mut self, entry: LogEntry) {
        self.by_op_id.insert(entry.op.op_id.clone(), entry.seq);
        self.entries.push(entry);
    }

    fn get(&self, op_id: &str) -> Option<LogEntry> {
        let seq = *self.by_op_id.get(op_id)?;
        let idx = self.entries.binary_search_by_key(&seq, |e| e.seq).ok()?;
        self.entries.get(idx).cloned()
    }

    fn after(&self, since: u64, limit: usize) -> Vec<LogEntry> {
        let start = self.entries.partition_point(|e| e.seq <= since);
        self.entries[start..].iter().take(limit).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryStorage
// ---------------------------------------------------------------------------

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    workspaces: Mutex<HashMap<String, WorkspaceLog>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn insert_entry(&self, workspace: &str, entry: &LogEntry) -> Result<InsertOutcome, StorageError> {
        let mut workspaces = self.workspaces.lock();
        let log = workspaces.entry(workspace.to_string()).or_default();
        if let Some(seq) = log.check(entry)? {
            return Ok(InsertOutcome::Duplicate(seq));
        }
        log.push(entry.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn entry_by_op_id(
        &self,
        workspace: &str,
        op_id: &str,
    ) -> Result<Option<LogEntry>, StorageError> {
        Ok(self
            .workspaces
            .lock()
            .get(workspace)
            .and_then(|log| log.get(op_id)))
    }

    fn entries_after(
        &self,
        workspace: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self
            .workspaces
            .lock()
            .get(workspace)
            .map(|log| log.after(since, limit))
            .unwrap_or_default())
    }

    fn max_seq(&self, workspace: &str) -> Result<u64, StorageError> {
        Ok(self
            .workspaces
            .lock()
            .get(workspace)
            .map_or(0, WorkspaceLog::head))
    }

    fn load_snapshot(&self, workspace: &str) -> Result<Snapshot, StorageError> {
        Ok(self
            .workspaces
            .lock()
            .get(workspace)
            .and_then(|log| log.snapshot.clone())
            .unwrap_or_default())
    }

    fn save_snapshot(&self, workspace: &str, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.workspaces
            .lock()
            .entry(workspace.to_string())
            .or_default()
            .snapshot = Some(snapshot.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStorage
// ---------------------------------------------------------------------------

const LOG_FILE: &str = "ops.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TMP_FILE: &str = "snapshot.json.tmp";

/// File-backed storage rooted at a data directory.
///
/// Layout: `<root>/<workspace-dir>/ops.jsonl` and `snapshot.json`. Each
/// workspace's log is read once on first access and indexed in memory;
/// appends are written and synced before returning. Each workspace has its
/// own lock, so a slow sync on one never holds up another.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    loaded: Mutex<HashMap<String, Arc<Mutex<Option<WorkspaceLog>>>>>,
}

impl FileStorage {
    /// Opens (creating if needed) a data directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding one workspace's files.
    ///
    /// Plain ids map to `n-<id>`; anything else is hex-encoded as `x-<hex>`
    /// so arbitrary workspace ids stay filesystem-safe.
    fn workspace_dir(&self, workspace: &str) -> PathBuf {
        let plain = !workspace.is_empty()
            && workspace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let name = if plain {
            format!("n-{workspace}")
        } else {
            let hex: String = workspace.bytes().map(|b| format!("{b:02x}")).collect();
            format!("x-{hex}")
        };
        self.root.join(name)
    }

    /// Runs `f` against the in-memory index of `workspace`, loading it from
    /// disk on first use.
    fn with_log<T>(
        &self,
        workspace: &str,
        f: impl FnOnce(&mut WorkspaceLog, &Path) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let dir = self.workspace_dir(workspace);
        let slot = Arc::clone(self.loaded.lock().entry(workspace.to_string()).or_default());
        let mut slot = slot.lock();
        let log = match slot.take() {
            Some(log) => log,
            None => read_workspace(&dir)?,
        };
        f(slot.insert(log), &dir)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_workspace(dir: &Path) -> Result<WorkspaceLog, StorageError> {
    let mut log = WorkspaceLog::default();

    let log_path = dir.join(LOG_FILE);
    match File::open(&log_path) {
        Ok(file) => {
            let lines: Vec<String> = BufReader::new(file)
                .lines()
                .collect::<Result<_, _>>()
                .map_err(io_err(&log_path))?;
            let last = lines.len();
            let mut valid_len = 0u64;
            for (i, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    valid_len += line.len() as u64 + 1;
                    continue;
                }
                match serde_json::from_str::<LogEntry>(line) {
                    Ok(entry) => {
                        log.push(entry);
                        valid_len += line.len() as u64 + 1;
                    }
                    // A torn final line means the process died mid-append;
                    // the append was never acknowledged. Cut it off so the
                    // next append starts on a clean line.
                    Err(e) if i + 1 == last => {
                        tracing::warn!(path = %log_path.display(), error = %e, "truncating torn tail record");
                        OpenOptions::new()
                            .write(true)
                            .open(&log_path)
                            .and_then(|f| f.set_len(valid_len))
                            .map_err(io_err(&log_path))?;
                    }
                    Err(e) => {
                        return Err(StorageError::Corrupt {
                            path: log_path,
                            line: i + 1,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(&log_path)(e)),
    }

    let snap_path = dir.join(SNAPSHOT_FILE);
    match fs::read_to_string(&snap_path) {
        Ok(contents) => {
            let snapshot =
                serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt {
                    path: snap_path.clone(),
                    line: e.line(),
                    reason: e.to_string(),
                })?;
            log.snapshot = Some(snapshot);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(&snap_path)(e)),
    }

    tracing::debug!(dir = %dir.display(), entries = log.entries.len(), "workspace log loaded");
    Ok(log)
}

impl Storage for FileStorage {
    fn insert_entry(&self, workspace: &str, entry: &LogEntry) -> Result<InsertOutcome, StorageError> {
        self.with_log(workspace, |log, dir| {
            if let Some(seq) = log.check(entry)? {
                return Ok(InsertOutcome::Duplicate(seq));
            }
            // JSON has no encoding for non-finite floats.
            let mut entry = entry.clone();
            entry.op.normalize();
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');

            fs::create_dir_all(dir).map_err(io_err(dir))?;
            let path = dir.join(LOG_FILE);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(io_err(&path))?;
            file.write_all(line.as_bytes()).map_err(io_err(&path))?;
            file.sync_data().map_err(io_err(&path))?;

            log.push(entry);
            Ok(InsertOutcome::Inserted)
        })
    }

    fn entry_by_op_id(
        &self,
        workspace: &str,
        op_id: &str,
    ) -> Result<Option<LogEntry>, StorageError> {
        self.with_log(workspace, |log, _| Ok(log.get(op_id)))
    }

    fn entries_after(
        &self,
        workspace: &str,
        since: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StorageError> {
        self.with_log(workspace, |log, _| Ok(log.after(since, limit)))
    }

    fn max_seq(&self, workspace: &str) -> Result<u64, StorageError> {
        self.with_log(workspace, |log, _| Ok(log.head()))
    }

    fn load_snapshot(&self, workspace: &str) -> Result<Snapshot, StorageError> {
        self.with_log(workspace, |log, _| Ok(log.snapshot.clone().unwrap_or_default()))
    }

    fn save_snapshot(&self, workspace: &str, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.with_log(workspace, |log, dir| {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
            let tmp = dir.join(SNAPSHOT_TMP_FILE);
            let dest = dir.join(SNAPSHOT_FILE);
            let bytes = serde_json::to_vec(snapshot)?;
            {
                let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
                file.write_all(&bytes).map_err(io_err(&tmp))?;
                file.sync_all().map_err(io_err(&tmp))?;
            }
            fs::rename(&tmp, &dest).map_err(io_err(&dest))?;
            log.snapshot = Some(snapshot.clone());
            Ok(())
        })
    }

    fn blocks_on_io(&self) -> bool {
        true
    }
}
