//! Reconciliation properties: the task set is the permission-filtered
//! symmetric difference of the two trees, and re-running reconciliation
//! on a converged state produces nothing.

use peersync::registry::{Profile, ProfileFlags};
use peersync::transfer::{plan_tasks, Direction, TransferTask};
use peersync::wire::{IndexEntry, TaskKind};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

fn profile(flags: ProfileFlags) -> Profile {
    Profile {
        id: Uuid::new_v4(),
        path: PathBuf::from("/unused"),
        name: "prop".into(),
        flags,
        created_at: chrono::Utc::now(),
        shared_with: Vec::new(),
    }
}

fn open_flags() -> ProfileFlags {
    ProfileFlags {
        allow_send: true,
        allow_receive: true,
        allow_delete: true,
        skip_hidden: false,
    }
}

fn entry(seed: u8, size: u64, mtime_ms: i64) -> IndexEntry {
    IndexEntry {
        path: String::new(),
        size,
        mtime_ms,
        hash: Some([seed; 32]),
        is_dir: false,
    }
}

type Tree = BTreeMap<String, IndexEntry>;

/// Apply a plan's effect: each task copies the winning entry onto the
/// losing side.
fn apply_plan(local: &mut Tree, remote: &mut Tree, tasks: &[TransferTask]) {
    for task in tasks {
        match task.direction {
            Direction::Send => {
                if let Some(entry) = local.get(&task.path) {
                    remote.insert(task.path.clone(), entry.clone());
                }
            }
            Direction::Receive => {
                if let Some(entry) = remote.get(&task.path) {
                    local.insert(task.path.clone(), entry.clone());
                }
            }
        }
    }
}

fn arbitrary_tree() -> impl Strategy<Value = Tree> {
    prop::collection::btree_map(
        "[a-z]{1,8}(/[a-z]{1,8})?",
        (0u8..255, 0u64..100_000, 0i64..1_000_000),
        0..16,
    )
    .prop_map(|files| {
        files
            .into_iter()
            .map(|(path, (seed, size, mtime))| {
                let mut e = entry(seed, size, mtime);
                e.path = path.clone();
                (path, e)
            })
            .collect()
    })
}

proptest! {
    /// Convergence: applying the plan and re-planning yields nothing,
    /// from either side's perspective.
    #[test]
    fn reconciliation_is_idempotent_after_convergence(
        local in arbitrary_tree(),
        remote in arbitrary_tree(),
    ) {
        let profile = profile(open_flags());
        let mut local = local;
        let mut remote = remote;

        let tasks = plan_tasks(&profile, "peer", &local, &remote);
        apply_plan(&mut local, &mut remote, &tasks);

        prop_assert!(plan_tasks(&profile, "peer", &local, &remote).is_empty());
        prop_assert!(plan_tasks(&profile, "peer", &remote, &local).is_empty());
    }

    /// Every divergent path appears in the plan exactly once, and
    /// identical paths never do.
    #[test]
    fn plan_covers_symmetric_difference(
        local in arbitrary_tree(),
        remote in arbitrary_tree(),
    ) {
        let profile = profile(open_flags());
        let tasks = plan_tasks(&profile, "peer", &local, &remote);

        let mut planned = std::collections::HashSet::new();
        for task in &tasks {
            prop_assert!(planned.insert(task.path.clone()), "duplicate task for {}", task.path);
        }

        for (path, local_entry) in &local {
            let divergent = match remote.get(path) {
                None => true,
                Some(remote_entry) => local_entry.hash != remote_entry.hash,
            };
            prop_assert_eq!(planned.contains(path), divergent);
        }
        for path in remote.keys() {
            if !local.contains_key(path) {
                prop_assert!(planned.contains(path));
            }
        }
    }

    /// Direction filtering is exactly the local side's own flags.
    #[test]
    fn permissions_gate_directions(
        local in arbitrary_tree(),
        remote in arbitrary_tree(),
    ) {
        let mut flags = open_flags();
        flags.allow_send = false;
        let no_send = profile(flags);
        for task in plan_tasks(&no_send, "peer", &local, &remote) {
            prop_assert_eq!(task.direction, Direction::Receive);
        }

        let mut flags = open_flags();
        flags.allow_receive = false;
        let no_receive = profile(flags);
        for task in plan_tasks(&no_receive, "peer", &local, &remote) {
            prop_assert_eq!(task.direction, Direction::Send);
        }
    }
}

#[test]
fn asymmetric_grant_scenario() {
    // Profile P on A: allow-send, no receive. A has x.txt, B lacks it.
    let mut a_flags = ProfileFlags::default();
    a_flags.allow_send = true;
    a_flags.allow_receive = false;
    let a_profile = profile(a_flags);

    let mut a_tree = Tree::new();
    let mut x = entry(1, 10, 1000);
    x.path = "x.txt".into();
    a_tree.insert("x.txt".into(), x);
    let b_tree = Tree::new();

    // A plans one send task
    let a_tasks = plan_tasks(&a_profile, "b", &a_tree, &b_tree);
    assert_eq!(a_tasks.len(), 1);
    assert_eq!(a_tasks[0].direction, Direction::Send);
    assert_eq!(a_tasks[0].kind, TaskKind::Create);
    assert_eq!(a_tasks[0].path, "x.txt");

    // B, whose own allow-receive is false, plans nothing
    let mut b_flags = ProfileFlags::default();
    b_flags.allow_receive = false;
    let b_profile = Profile {
        id: a_profile.id,
        ..profile(b_flags)
    };
    let b_tasks = plan_tasks(&b_profile, "a", &b_tree, &a_tree);
    assert!(b_tasks.is_empty());
}

#[test]
fn conflict_scenario_later_timestamp_wins() {
    // Both sides modified notes.txt; A's timestamp is later.
    let a_profile = profile(open_flags());

    let mut a_tree = Tree::new();
    let mut a_notes = entry(1, 50, 2_000);
    a_notes.path = "notes.txt".into();
    a_tree.insert("notes.txt".into(), a_notes);

    let mut b_tree = Tree::new();
    let mut b_notes = entry(2, 5_000, 1_000);
    b_notes.path = "notes.txt".into();
    b_tree.insert("notes.txt".into(), b_notes);

    // A must send its version regardless of B's larger size
    let a_tasks = plan_tasks(&a_profile, "b", &a_tree, &b_tree);
    assert_eq!(a_tasks.len(), 1);
    assert_eq!(a_tasks[0].direction, Direction::Send);
    assert_eq!(a_tasks[0].kind, TaskKind::Update);

    // B reaches the mirror conclusion: receive A's version
    let b_tasks = plan_tasks(&a_profile, "a", &b_tree, &a_tree);
    assert_eq!(b_tasks.len(), 1);
    assert_eq!(b_tasks[0].direction, Direction::Receive);
}
