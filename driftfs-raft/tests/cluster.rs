//! Cluster scenarios for the consensus stack: three nodes, a deterministic
//! in-process wire, timeouts fired by hand.

mod fixtures;

use std::collections::BTreeSet;

use maplit::btreeset;
use pretty_assertions::assert_eq;

use driftfs_raft::request::{Add, Rename, Request, Update};
use driftfs_raft::state::Role;
use fixtures::Cluster;

fn add(from: &str, key: &str, version: &str) -> Request {
    Add {
        from: from.to_owned(),
        key: key.to_owned(),
        version: version.to_owned(),
    }
    .into()
}

fn update(from: &str, key: &str, old: &str, new: &str) -> Request {
    Update {
        from: from.to_owned(),
        key: key.to_owned(),
        old_version: old.to_owned(),
        new_version: new.to_owned(),
    }
    .into()
}

fn rename(from: &str, key: &str, new_key: &str, version: &str) -> Request {
    Rename {
        from: from.to_owned(),
        key: key.to_owned(),
        new_key: new_key.to_owned(),
        version: version.to_owned(),
    }
    .into()
}

/// An add submitted at a follower is forwarded, replicated and committed
/// on every node.
#[test]
fn add_replicates_to_all_nodes() {
    let mut cluster = Cluster::new(&["foo", "bar", "baz"]);
    cluster.elect("foo");

    cluster.submit("baz", add("baz", "root", "0"));
    // The next leader heartbeat carries the advanced commit index.
    cluster.timeout("foo");

    for id in ["foo", "bar", "baz"] {
        assert_eq!(
            cluster.version(id, "root"),
            Some(("0".to_owned(), "baz".to_owned())),
            "version map wrong on {id}"
        );
    }
    cluster.assert_logs_consistent();

    // Every node saw exactly one add notification.
    for id in ["foo", "bar", "baz"] {
        assert_eq!(cluster.listeners[id].adds.len(), 1);
    }
}

/// A second update from the same pre-state loses the race and is dropped
/// as invalid at the leader.
#[test]
fn concurrent_update_is_rejected_at_leader() {
    let mut cluster = Cluster::new(&["foo", "bar", "baz"]);
    cluster.elect("foo");

    cluster.submit("baz", add("baz", "root", "0"));
    cluster.timeout("foo");

    cluster.submit("baz", update("baz", "root", "0", "1"));
    // foo (the leader) sees a concurrent update from the same pre-state.
    cluster.submit("foo", update("foo", "root", "0", "X"));
    cluster.timeout("foo");

    for id in ["foo", "bar", "baz"] {
        assert_eq!(
            cluster.version(id, "root"),
            Some(("1".to_owned(), "baz".to_owned())),
            "version map wrong on {id}"
        );
    }
    cluster.assert_logs_consistent();
}

/// Renames move the key and preserve the version, cluster-wide.
#[test]
fn rename_moves_key_cluster_wide() {
    let mut cluster = Cluster::new(&["foo", "bar", "baz"]);
    cluster.elect("foo");

    cluster.submit("baz", add("baz", "root", "0"));
    cluster.timeout("foo");
    cluster.submit("baz", update("baz", "root", "0", "1"));
    cluster.timeout("foo");
    cluster.submit("bar", rename("bar", "root", "boot", "1"));
    cluster.timeout("foo");

    for id in ["foo", "bar", "baz"] {
        assert_eq!(
            cluster.version(id, "boot"),
            Some(("1".to_owned(), "bar".to_owned())),
            "version map wrong on {id}"
        );
        assert_eq!(cluster.version(id, "root"), None);
    }
}

/// A partitioned leader is deposed by a fresh election and rejoins as a
/// follower without log divergence.
#[test]
fn partitioned_leader_steps_down() {
    let mut cluster = Cluster::new(&["foo", "bar", "baz"]);
    cluster.elect("foo");
    cluster.submit("foo", add("foo", "root", "0"));
    cluster.timeout("foo");
    assert_eq!(cluster.term("foo"), 1);

    cluster.isolate("foo");

    // bar's election timeout fires behind the partition.
    cluster.timeout("bar");
    assert_eq!(cluster.role("bar"), Role::Leader);
    assert_eq!(cluster.term("bar"), 2);
    // Election safety: the old leader still leads term 1, the new one
    // leads term 2; no term ever has two leaders.
    assert_eq!(
        cluster.leaders().into_iter().collect::<BTreeSet<_>>(),
        btreeset! {"bar".to_owned(), "foo".to_owned()}
    );

    // The partition heals; the next heartbeat carries the later term.
    cluster.heal("foo");
    cluster.timeout("bar");

    assert_eq!(cluster.role("foo"), Role::Follower);
    assert_eq!(cluster.term("foo"), 2);
    assert_eq!(cluster.leaders(), vec!["bar".to_owned()]);
    cluster.assert_logs_consistent();

    // The rejoined node still serves the committed state.
    assert_eq!(
        cluster.version("foo", "root"),
        Some(("0".to_owned(), "foo".to_owned()))
    );
}

/// A node that missed a batch of appends is walked backwards to its match
/// point and caught up.
#[test]
fn lagging_follower_catches_up() {
    let mut cluster = Cluster::new(&["foo", "bar", "baz"]);
    cluster.elect("foo");

    cluster.submit("foo", add("foo", "a", "0"));
    cluster.timeout("foo");

    cluster.isolate("baz");
    cluster.submit("foo", add("foo", "b", "0"));
    cluster.submit("foo", update("foo", "a", "0", "1"));
    cluster.timeout("foo");
    assert_eq!(cluster.version("baz", "b"), None);

    cluster.heal("baz");
    cluster.timeout("foo");
    // One more round for the catch-up batch and its commit notice.
    cluster.timeout("foo");

    assert_eq!(cluster.last_index("baz"), cluster.last_index("foo"));
    assert_eq!(cluster.version("baz", "b"), Some(("0".to_owned(), "foo".to_owned())));
    assert_eq!(cluster.version("baz", "a"), Some(("1".to_owned(), "foo".to_owned())));
    cluster.assert_logs_consistent();
}

/// Commit notifications arrive in index order on every node.
#[test]
fn commits_apply_in_index_order() {
    let mut cluster = Cluster::new(&["foo", "bar", "baz"]);
    cluster.elect("foo");

    for (key, version) in [("a", "0"), ("b", "0"), ("c", "0")] {
        cluster.submit("foo", add("foo", key, version));
    }
    cluster.timeout("foo");

    for id in ["foo", "bar", "baz"] {
        let keys: Vec<&str> = cluster.listeners[id]
            .adds
            .iter()
            .map(|rpc| rpc.key.as_str())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"], "commit order wrong on {id}");
    }
}
