//! # Transfer Engine
//!
//! Per-profile reconciliation and file streaming.
//!
//! Reconciliation compares the local directory tree with the last-known
//! remote index and produces the permission-filtered set of transfer
//! tasks. The task set is always derived from the local listing, the
//! remote listing, and the permission flags; nothing mutates it by hand,
//! so re-running reconciliation on a converged tree yields an empty plan.
//!
//! Streaming writes incoming content to a partial file next to the
//! destination and atomically renames it into place only after the
//! content hash checks out; a failed or interrupted transfer never
//! surfaces as the final artifact, and the partial is reused to resume
//! from the last complete chunk.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::registry::{Profile, ProfileFlags};
use crate::wire::{IndexEntry, TaskKind, CHUNK_SIZE};

/// Files up to this size are content-hashed during a scan; larger files
/// rely on size + mtime comparison.
const HASH_CEILING: u64 = 8 * 1024 * 1024;

/// Suffix for in-progress partial downloads.
const PARTIAL_SUFFIX: &str = ".psync-part";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

/// One pending or in-flight move of one path in one direction.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub device_id: String,
    pub path: String,
    pub kind: TaskKind,
    pub direction: Direction,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub mtime_ms: i64,
    pub hash: Option<[u8; 32]>,
}

impl TransferTask {
    pub fn chunk_count(&self) -> u64 {
        self.total_bytes.div_ceil(CHUNK_SIZE as u64)
    }
}

/// How a path diverges between the two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    LocalOnly,
    RemoteOnly,
    Modified,
}

/// Tagged diff entry over the path-keyed index maps.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: String,
    pub divergence: Divergence,
    pub local: Option<IndexEntry>,
    pub remote: Option<IndexEntry>,
}

/// Whether a path is one of our in-progress partial downloads.
pub fn is_partial(relative_path: &str) -> bool {
    relative_path.ends_with(PARTIAL_SUFFIX)
}

/// Whether any component of a relative path is hidden (dot-prefixed).
pub fn is_hidden(relative_path: &str) -> bool {
    relative_path
        .split('/')
        .any(|component| component.starts_with('.'))
}

/// Validate a peer-supplied relative path before touching the disk.
///
/// Rejects absolute paths, parent-directory traversal, and drive-style
/// prefixes so a malicious index cannot escape the profile root.
pub fn sanitize_relative_path(relative_path: &str) -> Result<PathBuf> {
    if relative_path.is_empty() {
        return Err(anyhow!("empty relative path"));
    }
    let path = Path::new(relative_path);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            other => {
                return Err(anyhow!(
                    "unsafe path component {:?} in {:?}",
                    other,
                    relative_path
                ))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(anyhow!("path {:?} resolves to nothing", relative_path));
    }
    Ok(clean)
}

/// Enumerate a profile directory into a path-keyed index.
///
/// Paths are profile-relative with `/` separators. Directories appear as
/// zero-size entries so empty-directory divergence is visible. Partial
/// download files are never indexed.
pub async fn scan_tree(root: &Path, skip_hidden: bool) -> Result<BTreeMap<String, IndexEntry>> {
    let mut index = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let relative = match path.strip_prefix(root) {
                Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if skip_hidden && is_hidden(&relative) {
                continue;
            }
            if relative.ends_with(PARTIAL_SUFFIX) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Skipping unreadable entry {}: {}", path.display(), e);
                    continue;
                }
            };

            if metadata.is_dir() {
                index.insert(
                    relative.clone(),
                    IndexEntry {
                        path: relative,
                        size: 0,
                        mtime_ms: mtime_ms(&metadata),
                        hash: None,
                        is_dir: true,
                    },
                );
                pending.push(path);
            } else if metadata.is_file() {
                let hash = if metadata.len() <= HASH_CEILING {
                    match tokio::fs::read(&path).await {
                        Ok(content) => Some(blake3::hash(&content).into()),
                        Err(e) => {
                            warn!("Failed to hash {}: {}", path.display(), e);
                            None
                        }
                    }
                } else {
                    None
                };
                index.insert(
                    relative.clone(),
                    IndexEntry {
                        path: relative,
                        size: metadata.len(),
                        mtime_ms: mtime_ms(&metadata),
                        hash,
                        is_dir: false,
                    },
                );
            }
        }
    }

    Ok(index)
}

fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert an announced flat index into the path-keyed map reconciliation
/// works over.
pub fn index_to_map(index: &[IndexEntry]) -> BTreeMap<String, IndexEntry> {
    index
        .iter()
        .map(|entry| (entry.path.clone(), entry.clone()))
        .collect()
}

fn entries_differ(local: &IndexEntry, remote: &IndexEntry) -> bool {
    if local.is_dir || remote.is_dir {
        return local.is_dir != remote.is_dir;
    }
    if let (Some(a), Some(b)) = (&local.hash, &remote.hash) {
        return a != b;
    }
    local.size != remote.size || local.mtime_ms != remote.mtime_ms
}

/// Symmetric difference of the two trees as a tagged diff.
pub fn diff_trees(
    local: &BTreeMap<String, IndexEntry>,
    remote: &BTreeMap<String, IndexEntry>,
) -> Vec<DiffEntry> {
    let mut diff = Vec::new();

    for (path, local_entry) in local {
        match remote.get(path) {
            None => diff.push(DiffEntry {
                path: path.clone(),
                divergence: Divergence::LocalOnly,
                local: Some(local_entry.clone()),
                remote: None,
            }),
            Some(remote_entry) => {
                if entries_differ(local_entry, remote_entry) {
                    diff.push(DiffEntry {
                        path: path.clone(),
                        divergence: Divergence::Modified,
                        local: Some(local_entry.clone()),
                        remote: Some(remote_entry.clone()),
                    });
                }
            }
        }
    }
    for (path, remote_entry) in remote {
        if !local.contains_key(path) {
            diff.push(DiffEntry {
                path: path.clone(),
                divergence: Divergence::RemoteOnly,
                local: None,
                remote: Some(remote_entry.clone()),
            });
        }
    }
    diff
}

/// Which side of a modified-on-both conflict wins.
///
/// Later modification time wins; an exact tie prefers the larger file;
/// a full tie with differing hashes falls back to the larger hash so
/// both peers reach the same verdict without another round-trip.
fn local_wins_conflict(local: &IndexEntry, remote: &IndexEntry) -> bool {
    if local.mtime_ms != remote.mtime_ms {
        return local.mtime_ms > remote.mtime_ms;
    }
    if local.size != remote.size {
        return local.size > remote.size;
    }
    match (&local.hash, &remote.hash) {
        (Some(a), Some(b)) => a >= b,
        _ => true,
    }
}

/// Reconciliation: permission-filtered task derivation for one share.
///
/// Each side filters by its *own* flags only; the counterpart enforces
/// its flags when offers arrive. The effective behavior is therefore the
/// intersection of what both sides allow.
pub fn plan_tasks(
    profile: &Profile,
    device_id: &str,
    local: &BTreeMap<String, IndexEntry>,
    remote: &BTreeMap<String, IndexEntry>,
) -> Vec<TransferTask> {
    let flags = &profile.flags;
    let mut tasks = Vec::new();

    for entry in diff_trees(local, remote) {
        if flags.skip_hidden && is_hidden(&entry.path) {
            continue;
        }
        match entry.divergence {
            Divergence::LocalOnly => {
                let local_entry = entry.local.expect("local entry present");
                if !flags.allow_send {
                    continue;
                }
                tasks.push(task_for(
                    profile.id,
                    device_id,
                    &entry.path,
                    if local_entry.is_dir {
                        TaskKind::MkDir
                    } else {
                        TaskKind::Create
                    },
                    Direction::Send,
                    &local_entry,
                ));
            }
            Divergence::RemoteOnly => {
                let remote_entry = entry.remote.expect("remote entry present");
                if !flags.allow_receive {
                    continue;
                }
                tasks.push(task_for(
                    profile.id,
                    device_id,
                    &entry.path,
                    if remote_entry.is_dir {
                        TaskKind::MkDir
                    } else {
                        TaskKind::Create
                    },
                    Direction::Receive,
                    &remote_entry,
                ));
            }
            Divergence::Modified => {
                let local_entry = entry.local.expect("local entry present");
                let remote_entry = entry.remote.expect("remote entry present");
                // Type flip (file vs dir) resolves like a content conflict
                if local_wins_conflict(&local_entry, &remote_entry) {
                    if flags.allow_send {
                        tasks.push(task_for(
                            profile.id,
                            device_id,
                            &entry.path,
                            TaskKind::Update,
                            Direction::Send,
                            &local_entry,
                        ));
                    }
                } else if flags.allow_receive {
                    tasks.push(task_for(
                        profile.id,
                        device_id,
                        &entry.path,
                        TaskKind::Update,
                        Direction::Receive,
                        &remote_entry,
                    ));
                }
            }
        }
    }
    tasks
}

fn task_for(
    profile_id: Uuid,
    device_id: &str,
    path: &str,
    kind: TaskKind,
    direction: Direction,
    entry: &IndexEntry,
) -> TransferTask {
    TransferTask {
        id: Uuid::new_v4(),
        profile_id,
        device_id: device_id.to_string(),
        path: path.to_string(),
        kind,
        direction,
        total_bytes: if entry.is_dir { 0 } else { entry.size },
        completed_bytes: 0,
        mtime_ms: entry.mtime_ms,
        hash: entry.hash,
    }
}

/// Read one chunk of a file being sent.
pub async fn read_chunk(root: &Path, relative_path: &str, seq: u64) -> Result<Vec<u8>, SyncError> {
    let clean = sanitize_relative_path(relative_path)
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    let path = root.join(clean);
    let mut file = File::open(&path).await.map_err(|e| SyncError::TransferIo {
        path: path.clone(),
        source: e,
    })?;
    file.seek(SeekFrom::Start(seq * CHUNK_SIZE as u64))
        .await
        .map_err(|e| SyncError::TransferIo {
            path: path.clone(),
            source: e,
        })?;

    let mut data = vec![0u8; CHUNK_SIZE];
    let mut filled = 0;
    while filled < data.len() {
        let n = file
            .read(&mut data[filled..])
            .await
            .map_err(|e| SyncError::TransferIo {
                path: path.clone(),
                source: e,
            })?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(data)
}

/// Receiver-side state for one incoming file.
///
/// Content accumulates in `<destination>.psync-part`; `finish` verifies
/// the hash and renames into place. Dropping the value leaves the partial
/// on disk so a reconnect can resume from it.
pub struct IncomingFile {
    final_path: PathBuf,
    partial_path: PathBuf,
    file: File,
    next_seq: u64,
    bytes_written: u64,
    expected_size: u64,
}

impl IncomingFile {
    /// Open (or resume) the partial file for an offered transfer.
    ///
    /// Returns the handle and the chunk index the sender should resume
    /// from. An existing partial is truncated to a chunk boundary and
    /// kept; anything else starts from zero.
    pub async fn begin(
        root: &Path,
        relative_path: &str,
        expected_size: u64,
    ) -> Result<(Self, u64), SyncError> {
        let clean = sanitize_relative_path(relative_path)
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        let final_path = root.join(&clean);
        let partial_path = partial_path_for(&final_path);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::TransferIo {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let existing_len = match tokio::fs::metadata(&partial_path).await {
            Ok(metadata) if metadata.is_file() => metadata.len().min(expected_size),
            _ => 0,
        };
        let resume_chunk = existing_len / CHUNK_SIZE as u64;
        let resume_bytes = resume_chunk * CHUNK_SIZE as u64;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&partial_path)
            .await
            .map_err(|e| SyncError::TransferIo {
                path: partial_path.clone(),
                source: e,
            })?;
        file.set_len(resume_bytes)
            .await
            .map_err(|e| SyncError::TransferIo {
                path: partial_path.clone(),
                source: e,
            })?;

        let mut incoming = Self {
            final_path,
            partial_path,
            file,
            next_seq: resume_chunk,
            bytes_written: resume_bytes,
            expected_size,
        };
        incoming
            .file
            .seek(SeekFrom::Start(resume_bytes))
            .await
            .map_err(|e| SyncError::TransferIo {
                path: incoming.partial_path.clone(),
                source: e,
            })?;

        Ok((incoming, resume_chunk))
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.expected_size
    }

    /// Append one chunk. Chunks must arrive in sequence order.
    pub async fn write_chunk(&mut self, seq: u64, data: &[u8]) -> Result<(), SyncError> {
        if seq != self.next_seq {
            return Err(SyncError::Protocol(format!(
                "out-of-order chunk: expected {}, got {}",
                self.next_seq, seq
            )));
        }
        self.file
            .write_all(data)
            .await
            .map_err(|e| SyncError::TransferIo {
                path: self.partial_path.clone(),
                source: e,
            })?;
        self.next_seq += 1;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Verify content and atomically move the file into place.
    pub async fn finish(mut self, expected_hash: Option<[u8; 32]>) -> Result<(), SyncError> {
        self.file
            .flush()
            .await
            .map_err(|e| SyncError::TransferIo {
                path: self.partial_path.clone(),
                source: e,
            })?;
        self.file
            .sync_all()
            .await
            .map_err(|e| SyncError::TransferIo {
                path: self.partial_path.clone(),
                source: e,
            })?;

        if let Some(expected) = expected_hash {
            let content =
                tokio::fs::read(&self.partial_path)
                    .await
                    .map_err(|e| SyncError::TransferIo {
                        path: self.partial_path.clone(),
                        source: e,
                    })?;
            let actual: [u8; 32] = blake3::hash(&content).into();
            if actual != expected {
                // Corrupt partial is useless for resume as well
                let _ = tokio::fs::remove_file(&self.partial_path).await;
                return Err(SyncError::Integrity {
                    path: self.final_path.clone(),
                });
            }
        }

        tokio::fs::rename(&self.partial_path, &self.final_path)
            .await
            .map_err(|e| SyncError::TransferIo {
                path: self.final_path.clone(),
                source: e,
            })?;
        debug!("Finalized {}", self.final_path.display());
        Ok(())
    }
}

fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(PARTIAL_SUFFIX);
    final_path.with_file_name(name)
}

/// Create an announced empty directory.
pub async fn apply_mkdir(root: &Path, relative_path: &str) -> Result<(), SyncError> {
    let clean = sanitize_relative_path(relative_path)
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    let path = root.join(clean);
    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|e| SyncError::TransferIo { path, source: e })
}

/// Apply a peer's delete notice, honoring this side's delete permission.
///
/// Returns whether anything was removed. Missing paths are a success;
/// the trees already agree.
pub async fn apply_delete(
    profile_root: &Path,
    flags: &ProfileFlags,
    relative_path: &str,
    is_dir: bool,
) -> Result<bool, SyncError> {
    if !flags.allow_delete {
        debug!(
            "Ignoring delete notice for {:?}: deletes not permitted here",
            relative_path
        );
        return Ok(false);
    }
    let clean = sanitize_relative_path(relative_path)
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    let path = profile_root.join(clean);

    let result = if is_dir {
        // Only empty directories are removed structurally
        tokio::fs::remove_dir(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::TransferIo { path, source: e }),
    }
}
