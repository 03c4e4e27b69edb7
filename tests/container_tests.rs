//! End-to-end scenarios for the shared tree container: attach, add, find,
//! glob, forced growth, and last-user cleanup.

mod common;

use shmtree::{SharedTree, ShmString, FLAG_DIRECTORY, FLAG_DUMMY, FLAG_FIRST_USER};

const KIB: usize = 1024;

// ============================================================================
// Basic add / find
// ============================================================================

#[test]
fn add_then_find_with_dummy_intermediates() {
    let name = common::unique_region("basic");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();

    let node = tree
        .add_file("a/b/c.txt", &7, 0, true)
        .unwrap()
        .expect("fresh path is created");
    assert_eq!(*node.data(), 7);
    assert!(!node.is_directory());
    assert_eq!(node.name(), "c.txt");
    assert_eq!(node.path(), "a/b/c.txt");

    let found = tree.find("a/b/c.txt").unwrap().expect("findable");
    assert!(found.same_node(&node));

    let a = tree.find_or_err("a").unwrap();
    assert!(a.is_directory());
    assert!(a.has_flag(FLAG_DUMMY));
    let b = tree.find_or_err("a/b").unwrap();
    assert!(b.is_directory());
    assert!(b.has_flag(FLAG_DUMMY));

    // Parent/child wiring holds in both directions.
    assert!(node.parent().unwrap().same_node(&b));
    assert!(b.parent().unwrap().same_node(&a));
    assert!(a.parent().unwrap().same_node(&tree.root().unwrap()));
    assert_eq!(tree.root().unwrap().path(), "");
}

#[test]
fn lookup_ignores_case_and_separator_style() {
    let name = common::unique_region("case");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    let node = tree.add_file("a/b/c.txt", &1, 0, true).unwrap().unwrap();

    let upper = tree.find(r"A\B\C.TXT").unwrap().expect("case-insensitive");
    assert!(upper.same_node(&node));
    let mixed = tree.find("A/b\\C.txt").unwrap().expect("mixed separators");
    assert!(mixed.same_node(&node));
    assert!(tree.find("a/b/c.txt.bak").unwrap().is_none());
}

#[test]
fn overwrite_flag_controls_replacement() {
    let name = common::unique_region("ow");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();

    assert!(tree.add_file("x", &1, 0, false).unwrap().is_some());
    // Existing node, no overwrite: unchanged and None.
    assert!(tree.add_file("x", &2, 0, false).unwrap().is_none());
    assert_eq!(*tree.find_or_err("x").unwrap().data(), 1);
    // Overwrite: replaced.
    let replaced = tree.add_file("x", &2, 0, true).unwrap().expect("replaced");
    assert_eq!(*replaced.data(), 2);
    assert_eq!(*tree.find_or_err("x").unwrap().data(), 2);
}

#[test]
fn user_flags_are_preserved() {
    let name = common::unique_region("flags");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();

    let node = tree
        .add_file("marked.bin", &9, FLAG_FIRST_USER, true)
        .unwrap()
        .unwrap();
    assert!(node.has_flag(FLAG_FIRST_USER));
    assert!(!node.is_directory());

    let dir = tree.add_directory("data", &0, 0, true).unwrap().unwrap();
    assert!(dir.is_directory());
    assert!(!dir.has_flag(FLAG_DUMMY));

    // Caller policy can clear the dummy bit later (promotion).
    tree.add_file("data/sub/leaf.txt", &1, 0, true).unwrap().unwrap();
    let sub = tree.find_or_err("data/sub").unwrap();
    assert!(sub.has_flag(FLAG_DUMMY));
    sub.set_flag(FLAG_DUMMY, false);
    assert!(!sub.has_flag(FLAG_DUMMY));
    assert!(sub.has_flag(FLAG_DIRECTORY));
}

#[test]
fn explicit_directories_survive_interior_creation() {
    let name = common::unique_region("keepdir");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();

    let dir = tree.add_directory("data", &5, 0, true).unwrap().unwrap();
    tree.add_file("data/x.txt", &1, 0, true).unwrap().unwrap();

    // The interior walk reuses the existing directory, dummy or not.
    let found = tree.find_or_err("data").unwrap();
    assert!(found.same_node(&dir));
    assert!(!found.has_flag(FLAG_DUMMY));
    assert_eq!(*found.data(), 5);
}

// ============================================================================
// Traversal
// ============================================================================

#[test]
fn visit_path_walks_existing_prefix_in_order() {
    let name = common::unique_region("visit");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("a/b/c.txt", &1, 0, true).unwrap().unwrap();

    let mut seen = Vec::new();
    tree.visit_path("a/b/c.txt", |n| seen.push(n.name()))
        .unwrap();
    assert_eq!(seen, ["a", "b", "c.txt"]);

    // Stops at the first missing component.
    let mut partial = Vec::new();
    tree.visit_path("a/b/missing/deeper", |n| partial.push(n.name()))
        .unwrap();
    assert_eq!(partial, ["a", "b"]);
}

#[test]
fn children_iterate_in_case_insensitive_order() {
    let name = common::unique_region("order");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    for file in ["Zeta.txt", "alpha.txt", "Mid.txt"] {
        tree.add_file(file, &0, 0, true).unwrap().unwrap();
    }

    let names: Vec<String> = tree
        .root()
        .unwrap()
        .children()
        .map(|c| c.name())
        .collect();
    assert_eq!(names, ["alpha.txt", "Mid.txt", "Zeta.txt"]);
}

#[test]
fn remove_child_detaches_a_subtree() {
    let name = common::unique_region("erase");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("doomed/file.txt", &3, 0, true).unwrap().unwrap();
    tree.add_file("kept.txt", &4, 0, true).unwrap().unwrap();

    let root = tree.root().unwrap();
    let detached = root.remove_child("DOOMED").expect("case-insensitive erase");
    assert!(tree.find("doomed/file.txt").unwrap().is_none());
    assert!(tree.find("kept.txt").unwrap().is_some());
    // The detached subtree stays readable through its handle.
    assert_eq!(*detached.find("file.txt").unwrap().data(), 3);
}

#[test]
fn clear_empties_the_root() {
    let name = common::unique_region("clear");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("a/b/c.txt", &1, 0, true).unwrap().unwrap();
    tree.add_file("d.txt", &2, 0, true).unwrap().unwrap();

    tree.clear().unwrap();
    assert_eq!(tree.root().unwrap().child_count(), 0);
    assert!(tree.find("a/b/c.txt").unwrap().is_none());
    assert!(tree.find("d.txt").unwrap().is_none());

    // The tree is still usable afterwards.
    tree.add_file("fresh.txt", &9, 0, true).unwrap().unwrap();
    assert_eq!(*tree.find_or_err("fresh.txt").unwrap().data(), 9);
}

#[test]
fn recursive_count_includes_each_level_contribution() {
    let name = common::unique_region("count");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    // root -> a -> b -> c.txt: every node contributes 1 + direct children.
    tree.add_file("a/b/c.txt", &1, 0, true).unwrap().unwrap();
    assert_eq!(tree.node_count().unwrap(), 7);

    // An empty tree is a single root node.
    tree.clear().unwrap();
    assert_eq!(tree.node_count().unwrap(), 1);
}

// ============================================================================
// Glob
// ============================================================================

#[test]
fn glob_matches_within_one_directory() {
    let name = common::unique_region("glob1");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("a/foo.txt", &1, 0, true).unwrap().unwrap();
    tree.add_file("a/bar.txt", &2, 0, true).unwrap().unwrap();
    tree.add_file("a/sub/foo.log", &3, 0, true).unwrap().unwrap();

    let hits = tree.glob("a/*.txt").unwrap();
    let paths: Vec<String> = hits.iter().map(|n| n.path()).collect();
    assert_eq!(paths, ["a/bar.txt", "a/foo.txt"]);
}

#[test]
fn dir_star_matches_exactly_one_level() {
    let name = common::unique_region("glob2");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("a/foo.txt", &1, 0, true).unwrap().unwrap();
    tree.add_file("a/sub/foo.log", &3, 0, true).unwrap().unwrap();
    tree.add_file("a/sub/deep/other.log", &4, 0, true).unwrap().unwrap();

    let hits = tree.glob("a/*/*.log").unwrap();
    let paths: Vec<String> = hits.iter().map(|n| n.path()).collect();
    // One level below `a`, not two.
    assert_eq!(paths, ["a/sub/foo.log"]);
}

#[test]
fn glob_without_prefix_or_wildcard() {
    let name = common::unique_region("glob3");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("logs/app.log", &1, 0, true).unwrap().unwrap();
    tree.add_file("logs/db.log", &2, 0, true).unwrap().unwrap();

    // Wildcard-at-start matches locally from the root.
    let top: Vec<String> = tree
        .glob("*")
        .unwrap()
        .iter()
        .map(|n| n.name())
        .collect();
    assert_eq!(top, ["logs"]);

    // A fully literal pattern behaves like a lookup.
    let exact = tree.glob("logs/db.log").unwrap();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].path(), "logs/db.log");

    let question: Vec<String> = tree
        .glob("logs/??.log")
        .unwrap()
        .iter()
        .map(|n| n.name())
        .collect();
    assert_eq!(question, ["db.log"]);
}

#[test]
fn glob_is_case_insensitive() {
    let name = common::unique_region("glob4");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("Docs/Readme.MD", &1, 0, true).unwrap().unwrap();

    let hits = tree.glob("docs/*.md").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name(), "Readme.MD");
}

// ============================================================================
// Dump
// ============================================================================

#[test]
fn dump_indents_by_depth() {
    let name = common::unique_region("dump");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    tree.add_file("a/c.txt", &7, 0, true).unwrap().unwrap();

    let mut out = Vec::new();
    tree.dump(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text, " -> 0\n a -> 0\n  c.txt -> 7\n");
}

// ============================================================================
// String payloads
// ============================================================================

#[test]
fn string_payloads_live_in_the_segment() {
    let name = common::unique_region("strpay");
    let tree: SharedTree<ShmString> = SharedTree::attach(&name, 64 * KIB).unwrap();

    let node = tree
        .add_file("motd.txt", b"hello from the other side", 0, true)
        .unwrap()
        .unwrap();
    assert_eq!(node.data().as_bytes(node.segment()), b"hello from the other side");

    let found = tree.find_or_err("MOTD.TXT").unwrap();
    assert_eq!(
        found.data().to_string_lossy(found.segment()),
        "hello from the other side"
    );
}

// ============================================================================
// Forced growth (S5)
// ============================================================================

#[test]
fn forced_grow_migrates_to_doubled_successor() {
    let name = common::unique_region("grow");
    let tree: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    let follower: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();

    // Insert until the first allocation failure forces a migration.
    let mut added = Vec::new();
    let mut i: u64 = 0;
    while tree.shm_name() == name {
        let path = format!("dir_{:03}/file_{:05}.txt", i / 16, i);
        tree.add_file(&path, &i, 0, true).unwrap().unwrap();
        added.push((path, i));
        i += 1;
        assert!(i < 100_000, "segment never grew");
    }

    assert_eq!(tree.shm_name(), common::successor_of(&name));
    assert_eq!(tree.segment_size(), 128 * KIB);

    // Every pre-growth entry survived with its payload.
    for (path, value) in &added {
        let node = tree
            .find(path)
            .unwrap()
            .unwrap_or_else(|| panic!("{path} lost in migration"));
        assert_eq!(node.data(), value);
        assert_eq!(&node.path().to_lowercase(), path);
    }

    // The second handle observes `outdated` lazily and follows.
    let (first_path, first_value) = &added[0];
    let through_follower = follower.find_or_err(first_path).unwrap();
    assert_eq!(through_follower.data(), first_value);
    assert_eq!(follower.shm_name(), tree.shm_name());
}

#[test]
fn growth_preserves_string_payloads_and_structure() {
    let name = common::unique_region("growstr");
    let tree: SharedTree<ShmString> = SharedTree::attach(&name, 32 * KIB).unwrap();

    let mut i: u64 = 0;
    while tree.shm_name() == name {
        let path = format!("pkg/entry_{i:04}.dat");
        let body = format!("payload number {i}");
        tree.add_file(&path, body.as_bytes(), 0, true)
            .unwrap()
            .unwrap();
        i += 1;
        assert!(i < 100_000, "segment never grew");
    }

    for k in 0..i {
        let node = tree.find_or_err(&format!("pkg/entry_{k:04}.dat")).unwrap();
        assert_eq!(
            node.data().to_string_lossy(node.segment()),
            format!("payload number {k}")
        );
    }
    // Parent links were rebuilt by the deep copy.
    let sample = tree.find_or_err("pkg/entry_0000.dat").unwrap();
    assert_eq!(sample.parent().unwrap().name(), "pkg");
    assert_eq!(sample.path(), "pkg/entry_0000.dat");
}

// ============================================================================
// Refcount lifecycle (S6)
// ============================================================================

#[test]
fn last_detach_unlinks_the_region() {
    let name = common::unique_region("cleanup");
    {
        let a: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
        let b: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
        a.add_file("keep.txt", &1, 0, true).unwrap().unwrap();

        // Both handles see one tree.
        assert_eq!(*b.find_or_err("keep.txt").unwrap().data(), 1);

        drop(a);
        // Still alive: b holds a reference.
        assert_eq!(*b.find_or_err("keep.txt").unwrap().data(), 1);
    }

    // Everyone detached; a fresh attach builds a new, empty tree.
    let fresh: SharedTree<u64> = SharedTree::attach(&name, 64 * KIB).unwrap();
    assert!(fresh.find("keep.txt").unwrap().is_none());
    assert_eq!(fresh.root().unwrap().child_count(), 0);
}

#[test]
fn names_without_serial_get_one_appended() {
    let bare = format!("sht_bare_{}_x", std::process::id());
    let tree: SharedTree<u64> = SharedTree::attach(&bare, 64 * KIB).unwrap();
    assert_eq!(tree.shm_name(), format!("{bare}_1"));
}
