//! # Profile Watcher
//!
//! Watches profile directories for local changes and feeds debounced
//! change batches to the Peer Manager: content changes trigger a
//! re-announce and re-reconciliation of the affected profile, deletions
//! become delete notices for the peers sharing it.
//!
//! Events are debounced with a quiet window so a burst of writes (an
//! editor save, a large copy) collapses into one reconciliation pass.

use anyhow::Result;
use notify::event::RemoveKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::Profile;
use crate::transfer;

/// Quiet window before a batch of raw events is processed.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// A debounced local filesystem change within a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    /// Content under the profile changed; re-reconcile it.
    Modified { profile_id: Uuid },
    /// A path disappeared; propagate as a delete notice.
    Removed {
        profile_id: Uuid,
        path: String,
        is_dir: bool,
    },
}

pub struct ProfileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ProfileWatcher {
    /// Watch every profile root recursively. Debounced changes arrive on
    /// `changes_tx`.
    pub fn new(profiles: Vec<Profile>, changes_tx: mpsc::Sender<LocalChange>) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>(1024);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Callback runs on the notify thread; nothing to do if the
            // engine side is gone
            let _ = raw_tx.blocking_send(res);
        })?;

        for profile in &profiles {
            if let Err(e) = watcher.watch(&profile.path, RecursiveMode::Recursive) {
                warn!("Cannot watch {}: {}", profile.path.display(), e);
            } else {
                debug!("Watching {} for {}", profile.path.display(), profile.name);
            }
        }

        let task = tokio::spawn(debounce_loop(profiles, raw_rx, changes_tx));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ProfileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_loop(
    profiles: Vec<Profile>,
    mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
    changes_tx: mpsc::Sender<LocalChange>,
) {
    let mut pending: Vec<LocalChange> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let quiet = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            event = raw_rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        let changes = classify(&event, &profiles);
                        if !changes.is_empty() {
                            pending.extend(changes);
                            deadline = Some(Instant::now() + DEBOUNCE_WINDOW);
                        }
                    }
                    Some(Err(e)) => warn!("Filesystem watch error: {}", e),
                    None => {
                        flush(&mut pending, &changes_tx).await;
                        return;
                    }
                }
            }
            _ = quiet => {
                flush(&mut pending, &changes_tx).await;
                deadline = None;
            }
        }
    }
}

/// Deduplicate and deliver a settled batch.
async fn flush(pending: &mut Vec<LocalChange>, changes_tx: &mpsc::Sender<LocalChange>) {
    let mut seen_modified = HashSet::new();
    let mut seen_removed = HashSet::new();
    for change in pending.drain(..) {
        let fresh = match &change {
            LocalChange::Modified { profile_id } => seen_modified.insert(*profile_id),
            LocalChange::Removed { profile_id, path, .. } => {
                seen_removed.insert((*profile_id, path.clone()))
            }
        };
        if fresh && changes_tx.send(change).await.is_err() {
            return;
        }
    }
}

/// Map one raw filesystem event onto profile-level changes.
fn classify(event: &Event, profiles: &[Profile]) -> Vec<LocalChange> {
    let mut changes = Vec::new();
    for path in &event.paths {
        let Some((profile, relative)) = owning_profile(path, profiles) else {
            continue;
        };
        // Our own partial downloads churn constantly during transfers
        if transfer::is_partial(&relative) {
            continue;
        }
        if profile.flags.skip_hidden && transfer::is_hidden(&relative) {
            continue;
        }

        match event.kind {
            EventKind::Remove(kind) => changes.push(LocalChange::Removed {
                profile_id: profile.id,
                path: relative,
                is_dir: matches!(kind, RemoveKind::Folder),
            }),
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any => {
                changes.push(LocalChange::Modified {
                    profile_id: profile.id,
                })
            }
            _ => {}
        }
    }
    changes
}

fn owning_profile<'a>(path: &Path, profiles: &'a [Profile]) -> Option<(&'a Profile, String)> {
    for profile in profiles {
        if let Ok(relative) = path.strip_prefix(&profile.path) {
            let relative = relative.to_string_lossy().replace('\\', "/");
            if relative.is_empty() {
                // Event on the profile root itself
                continue;
            }
            return Some((profile, relative));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProfileFlags;
    use notify::event::{CreateKind, ModifyKind};
    use std::path::PathBuf;

    fn test_profile(root: &str) -> Profile {
        Profile {
            id: Uuid::new_v4(),
            path: PathBuf::from(root),
            name: "docs".into(),
            flags: ProfileFlags::default(),
            created_at: chrono::Utc::now(),
            shared_with: Vec::new(),
        }
    }

    fn event(kind: EventKind, path: &str) -> Event {
        let mut event = Event::new(kind);
        event.paths.push(PathBuf::from(path));
        event
    }

    #[test]
    fn test_modify_maps_to_owning_profile() {
        let profile = test_profile("/data/docs");
        let changes = classify(
            &event(
                EventKind::Modify(ModifyKind::Any),
                "/data/docs/notes/today.md",
            ),
            &[profile.clone()],
        );
        assert_eq!(
            changes,
            vec![LocalChange::Modified {
                profile_id: profile.id
            }]
        );
    }

    #[test]
    fn test_remove_carries_relative_path() {
        let profile = test_profile("/data/docs");
        let changes = classify(
            &event(EventKind::Remove(RemoveKind::File), "/data/docs/old.txt"),
            &[profile.clone()],
        );
        assert_eq!(
            changes,
            vec![LocalChange::Removed {
                profile_id: profile.id,
                path: "old.txt".into(),
                is_dir: false,
            }]
        );
    }

    #[test]
    fn test_events_outside_profiles_ignored() {
        let profile = test_profile("/data/docs");
        let changes = classify(
            &event(EventKind::Create(CreateKind::File), "/tmp/unrelated.txt"),
            &[profile],
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_hidden_and_partial_paths_ignored() {
        let profile = test_profile("/data/docs");
        let hidden = classify(
            &event(EventKind::Create(CreateKind::File), "/data/docs/.git/HEAD"),
            &[profile.clone()],
        );
        assert!(hidden.is_empty());

        let partial = classify(
            &event(
                EventKind::Modify(ModifyKind::Any),
                "/data/docs/movie.mkv.psync-part",
            ),
            &[profile],
        );
        assert!(partial.is_empty());
    }

    #[test]
    fn test_flush_deduplicates_batch() {
        let profile_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        let mut pending = vec![
            LocalChange::Modified { profile_id },
            LocalChange::Modified { profile_id },
            LocalChange::Removed {
                profile_id,
                path: "gone.txt".into(),
                is_dir: false,
            },
            LocalChange::Removed {
                profile_id,
                path: "gone.txt".into(),
                is_dir: false,
            },
        ];

        tokio_test::block_on(flush(&mut pending, &tx));
        drop(tx);

        let mut received = Vec::new();
        while let Ok(change) = rx.try_recv() {
            received.push(change);
        }
        assert_eq!(received.len(), 2);
    }
}
