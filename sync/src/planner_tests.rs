//! Planner behavior: version resolution, staleness, and directory planning

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::planner::{build_compare_plan, PlanBundle};
use crate::scanner::ScanOptions;

struct Trees {
    _root: TempDir,
    left: PathBuf,
    right: PathBuf,
}

fn trees() -> Trees {
    let root = TempDir::new().unwrap();
    let left = root.path().join("left");
    let right = root.path().join("right");
    std::fs::create_dir_all(&left).unwrap();
    std::fs::create_dir_all(&right).unwrap();
    Trees {
        _root: root,
        left,
        right,
    }
}

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn plan(trees: &Trees) -> PlanBundle {
    build_compare_plan(&trees.left, &trees.right, &ScanOptions::default()).unwrap()
}

#[test]
fn highest_version_wins() {
    let t = trees();
    write(&t.left, "folder/doc_v1.txt", b"one");
    write(&t.left, "folder/doc_v3.txt", b"three");
    write(&t.right, "folder/doc.txt", b"old");

    let bundle = plan(&t);
    assert_eq!(bundle.plan.len(), 1);
    let item = &bundle.plan[0];
    assert_eq!(item.source_relative_path, PathBuf::from("folder/doc_v3.txt"));
    assert_eq!(item.target_relative_path, PathBuf::from("folder/doc.txt"));
    assert_eq!(item.version, 3);
    assert!(item.destination_exists);
    assert_eq!(item.destination_size, Some(3));
}

#[test]
fn unversioned_names_map_to_themselves() {
    let t = trees();
    write(&t.left, "plain.txt", b"data");

    let bundle = plan(&t);
    assert_eq!(bundle.plan.len(), 1);
    assert_eq!(bundle.plan[0].target_relative_path, PathBuf::from("plain.txt"));
    assert_eq!(bundle.plan[0].version, 0);
}

#[test]
fn version_zero_candidate_loses_to_any_versioned_one() {
    let t = trees();
    write(&t.left, "doc.txt", b"unversioned");
    write(&t.left, "doc_v1.txt", b"one");

    let bundle = plan(&t);
    assert_eq!(bundle.plan.len(), 1);
    assert_eq!(bundle.plan[0].source_relative_path, PathBuf::from("doc_v1.txt"));
    assert_eq!(bundle.plan[0].version, 1);
}

#[test]
fn equal_versions_tie_break_to_smallest_source_path() {
    // two stems with the same version mapping to the same target through
    // case differences in the marker
    let t = trees();
    write(&t.left, "doc_v2.txt", b"lower");
    write(&t.left, "doc_V2.txt", b"upper");

    let bundle = plan(&t);
    assert_eq!(bundle.plan.len(), 1);
    // 'V' < 'v' in byte order, so the uppercase variant wins the tie
    assert_eq!(bundle.plan[0].source_relative_path, PathBuf::from("doc_V2.txt"));
}

#[test]
fn size_equality_suppresses_the_copy() {
    let t = trees();
    write(&t.left, "same_v1.txt", b"12345");
    write(&t.right, "same.txt", b"abcde"); // same size, different bytes
    write(&t.left, "stale_v1.txt", b"123456");
    write(&t.right, "stale.txt", b"ab");

    let bundle = plan(&t);
    assert_eq!(bundle.plan.len(), 1);
    assert_eq!(bundle.plan[0].target_relative_path, PathBuf::from("stale.txt"));
    assert_eq!(bundle.total_candidates, 2);
    assert_eq!(bundle.pending_count, 1);
}

#[test]
fn plan_is_sorted_by_target_relative_path() {
    let t = trees();
    write(&t.left, "zeta_v1.txt", b"z");
    write(&t.left, "alpha_v1.txt", b"aa");
    write(&t.left, "mid/beta_v1.txt", b"bbb");

    let bundle = plan(&t);
    let targets: Vec<&Path> = bundle
        .plan
        .iter()
        .map(|item| item.target_relative_path.as_path())
        .collect();
    let mut sorted = targets.clone();
    sorted.sort();
    assert_eq!(targets, sorted);
}

#[test]
fn directories_only_cover_missing_parents() {
    let t = trees();
    write(&t.left, "alpha/beta/file_v1.txt", b"hello");
    write(&t.left, "existing/other_v1.txt", b"x");
    std::fs::create_dir_all(t.right.join("existing")).unwrap();

    let bundle = plan(&t);
    assert_eq!(
        bundle.directories_to_create,
        vec![PathBuf::from("alpha/beta")]
    );
}

#[test]
fn directory_conflict_with_a_file_is_fatal() {
    let t = trees();
    write(&t.left, "alpha/file_v1.txt", b"hello");
    write(&t.right, "alpha", b"i am a file");

    let err =
        build_compare_plan(&t.left, &t.right, &ScanOptions::default()).unwrap_err();
    assert_eq!(err.code(), "DESTINATION_PATH_CONFLICT");
}

#[test]
fn ignored_and_extensionless_sources_never_enter_the_plan() {
    let t = trees();
    write(&t.left, ".hidden/file_v1.txt", b"x");
    write(&t.left, ".DS_Store", b"x");
    write(&t.left, "Thumbs.db", b"x");
    write(&t.left, "desktop.ini", b"x");
    write(&t.left, "notes_v3", b"x");
    write(&t.left, "visible/readme_v2.txt", b"x");

    let bundle = plan(&t);
    assert_eq!(bundle.plan.len(), 1);
    assert_eq!(
        bundle.plan[0].target_relative_path,
        PathBuf::from("visible/readme.txt")
    );
}

#[test]
fn missing_left_root_is_invalid() {
    let t = trees();
    let missing = t.left.join("nope");
    let err = build_compare_plan(&missing, &t.right, &ScanOptions::default()).unwrap_err();
    assert_eq!(err.code(), "INVALID_DIRECTORY");
}

#[test]
fn nested_roots_are_rejected() {
    let t = trees();
    let nested = t.left.join("inner");
    std::fs::create_dir_all(&nested).unwrap();
    let err = build_compare_plan(&t.left, &nested, &ScanOptions::default()).unwrap_err();
    assert_eq!(err.code(), "INVALID_DIRECTORY");
}

#[test]
fn plan_determinism() {
    let t = trees();
    write(&t.left, "a_v1.txt", b"a");
    write(&t.left, "b/c_v2.txt", b"cc");
    write(&t.left, "b/c_v1.txt", b"c");

    let first = plan(&t);
    let second = plan(&t);
    assert_eq!(first.plan, second.plan);
    assert_eq!(first.directories_to_create, second.directories_to_create);
}
