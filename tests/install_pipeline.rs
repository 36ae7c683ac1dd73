//! End-to-end scenarios exercising the full parse -> plan -> fetch ->
//! extract -> materialize -> link pipeline against a real HTTP server and
//! a real filesystem (tempdir-backed).

mod common;

use corepm::config::{CoreConfig, LinkStrategy, VerifyPolicy};
use corepm::pipeline::{run_install, CancellationToken, InstallOptions};
use std::collections::HashMap;

fn base_config(store_path: std::path::PathBuf) -> CoreConfig {
    CoreConfig {
        store_path,
        fetch_concurrency: 4,
        fs_concurrency: 4,
        link_strategy: LinkStrategy::Auto,
        verify_policy: VerifyPolicy::Strict,
        connect_timeout_ms: 5_000,
        request_timeout_ms: 10_000,
        max_retries: 3,
        no_rust_binary: false,
    }
}

async fn install(project_root: &std::path::Path, lockfile: &std::path::Path, config: CoreConfig) -> corepm::InstallReport {
    run_install(InstallOptions {
        project_root: project_root.to_path_buf(),
        lockfile_path: lockfile.to_path_buf(),
        config,
        cancellation: CancellationToken::new(),
    })
    .await
}

/// Scenario 1: hardlink/clone-only install against an empty Store.
#[tokio::test]
async fn hardlink_only_install_from_empty_store() {
    let tarball = common::build_tarball(&[
        ("index.js", b"x", false),
        ("package.json", b"{\"name\":\"a\",\"version\":\"1.0.0\"}", false),
    ]);
    let integrity = common::sha512_integrity(&tarball);

    let mut files = HashMap::new();
    files.insert("/a-1.0.0.tgz".to_string(), tarball);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{"node_modules/a": {{"name": "a", "version": "1.0.0",
                "resolved": "{}", "integrity": "{integrity}"}}}}"#,
            server.url_for("/a-1.0.0.tgz")
        ),
    );

    let store_dir = root.path().join("store");
    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.fetch.attempts, 1);
    assert_eq!(report.extract.packages_extracted, 1);
    assert_eq!(report.extract.files_ingested, 2);
    assert!(report.materialize.cloned + report.materialize.linked + report.materialize.copied >= 1);

    assert_eq!(
        std::fs::read_to_string(project_dir.join("node_modules/a/index.js")).unwrap(),
        "x"
    );
    assert!(project_dir.join("node_modules/a/package.json").exists());
}

/// Scenario 2: Store already populated -> a fresh project root materializes
/// without any further fetch or extract work.
#[tokio::test]
async fn cache_warm_install_skips_fetch_and_extract() {
    let tarball = common::build_tarball(&[("index.js", b"x", false)]);
    let integrity = common::sha512_integrity(&tarball);

    let mut files = HashMap::new();
    files.insert("/a-1.0.0.tgz".to_string(), tarball);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{"node_modules/a": {{"name": "a", "version": "1.0.0",
                "resolved": "{}", "integrity": "{integrity}"}}}}"#,
            server.url_for("/a-1.0.0.tgz")
        ),
    );

    let store_dir = root.path().join("store");

    let first_project = root.path().join("project-1");
    std::fs::create_dir_all(&first_project).unwrap();
    let first = install(&first_project, &lockfile_path, base_config(store_dir.clone())).await;
    assert!(first.error.is_none());
    assert_eq!(first.fetch.attempts, 1);

    let second_project = root.path().join("project-2");
    std::fs::create_dir_all(&second_project).unwrap();
    let second = install(&second_project, &lockfile_path, base_config(store_dir)).await;

    assert!(second.error.is_none(), "unexpected error: {:?}", second.error);
    assert_eq!(second.fetch.attempts, 0);
    assert_eq!(second.extract.packages_extracted, 0);
    assert!(second_project.join("node_modules/a/index.js").exists());
}

/// Scenario 2b: rerunning install on the same project root a second time
/// mutates nothing and reports all-zero fetch/extract/materialize counts.
#[tokio::test]
async fn rerunning_install_on_same_project_is_a_no_op() {
    let tarball = common::build_tarball(&[("index.js", b"x", false)]);
    let integrity = common::sha512_integrity(&tarball);

    let mut files = HashMap::new();
    files.insert("/a-1.0.0.tgz".to_string(), tarball);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{"node_modules/a": {{"name": "a", "version": "1.0.0",
                "resolved": "{}", "integrity": "{integrity}"}}}}"#,
            server.url_for("/a-1.0.0.tgz")
        ),
    );

    let store_dir = root.path().join("store");
    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let first = install(&project_dir, &lockfile_path, base_config(store_dir.clone())).await;
    assert!(first.error.is_none(), "unexpected error: {:?}", first.error);

    let second = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(second.error.is_none(), "unexpected error: {:?}", second.error);
    assert_eq!(second.fetch.attempts, 0);
    assert_eq!(second.extract.packages_extracted, 0);
    assert_eq!(second.materialize.cloned, 0);
    assert_eq!(second.materialize.linked, 0);
    assert_eq!(second.materialize.copied, 0);
    assert!(project_dir.join("node_modules/a/index.js").exists());
}

/// Scenario 3: corrupted tarball bytes, digest left pointing at the
/// original content -> integrity mismatch, no Store or project mutation.
#[tokio::test]
async fn integrity_mismatch_is_rejected_before_any_placement() {
    let tarball = common::build_tarball(&[("index.js", b"x", false)]);
    let declared_integrity = common::sha512_integrity(&tarball);
    let mut corrupted = tarball.clone();
    corrupted[0] ^= 0xff;

    let mut files = HashMap::new();
    files.insert("/a-1.0.0.tgz".to_string(), corrupted);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{"node_modules/a": {{"name": "a", "version": "1.0.0",
                "resolved": "{}", "integrity": "{declared_integrity}"}}}}"#,
            server.url_for("/a-1.0.0.tgz")
        ),
    );

    let store_dir = root.path().join("store");
    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let report = install(&project_dir, &lockfile_path, base_config(store_dir.clone())).await;

    assert!(report.error.is_some());
    assert_eq!(report.error.as_ref().unwrap().kind, "IntegrityMismatch");
    assert!(!project_dir.join("node_modules/a").exists());

    let store = corepm::Store::new(store_dir).unwrap();
    let stats = corepm::store::layout_stats(store.layout()).await.unwrap();
    assert_eq!(stats.package_count, 0);
}

/// Scenario 4: a workspace-link placement becomes a symlink to the
/// workspace source, real placements land untouched.
#[tokio::test]
async fn workspace_link_becomes_a_symlink() {
    let tarball = common::build_tarball(&[("index.js", b"x", false)]);
    let integrity = common::sha512_integrity(&tarball);

    let mut files = HashMap::new();
    files.insert("/a-1.0.0.tgz".to_string(), tarball);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{
                "node_modules/a": {{"name": "a", "version": "1.0.0",
                    "resolved": "{}", "integrity": "{integrity}"}},
                "node_modules/foo": {{"name": "foo", "version": "0.0.0",
                    "link": true, "resolved": "packages/foo"}}
            }}"#,
            server.url_for("/a-1.0.0.tgz")
        ),
    );

    let project_dir = root.path().join("project");
    std::fs::create_dir_all(project_dir.join("packages/foo")).unwrap();
    std::fs::write(project_dir.join("packages/foo/index.js"), b"foo").unwrap();

    let store_dir = root.path().join("store");
    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.plan.real, 1);
    assert_eq!(report.plan.workspace_link, 1);

    let link_path = project_dir.join("node_modules/foo");
    #[cfg(unix)]
    {
        let meta = std::fs::symlink_metadata(&link_path).unwrap();
        assert!(meta.file_type().is_symlink());
    }
    assert_eq!(
        std::fs::read_to_string(link_path.join("index.js")).unwrap(),
        "foo"
    );
    assert!(project_dir.join("node_modules/a/index.js").exists());
}

/// Scenario 5: a scoped package declaring a `bin` entry gets a working
/// shim under its `.bin` scope.
#[tokio::test]
async fn scoped_package_with_executable_gets_a_shim() {
    let tarball = common::build_tarball(&[
        ("cli.js", b"#!/usr/bin/env node\n", true),
        ("package.json", b"{}", false),
    ]);
    let integrity = common::sha512_integrity(&tarball);

    let mut files = HashMap::new();
    files.insert("/tool-2.0.0.tgz".to_string(), tarball);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{"node_modules/@scope/tool": {{"name": "@scope/tool", "version": "2.0.0",
                "resolved": "{}", "integrity": "{integrity}",
                "bin": {{"tool": "./cli.js"}}}}}}"#,
            server.url_for("/tool-2.0.0.tgz")
        ),
    );

    let store_dir = root.path().join("store");
    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();

    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.bin.created, 1);

    let shim = project_dir.join("node_modules/.bin/tool");
    assert!(std::fs::symlink_metadata(&shim).is_ok());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let target = project_dir.join("node_modules/@scope/tool/cli.js");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }
}

/// Boundary: an empty lockfile produces an empty tree and a clean report.
#[tokio::test]
async fn empty_lockfile_yields_empty_tree() {
    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(&lockfile_path, "{}");

    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();
    let store_dir = root.path().join("store");

    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_none());
    assert_eq!(report.plan.real, 0);
    assert_eq!(report.plan.workspace_link, 0);
    assert_eq!(report.bin.created, 0);
    assert!(!project_dir.join("node_modules").exists());
}

/// Boundary: a placement whose `os` excludes the host is skipped, not
/// materialized, and counted in the report.
#[tokio::test]
async fn platform_excluded_placement_is_skipped() {
    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        r#"{"node_modules/win-only": {"name": "win-only", "version": "1.0.0",
            "integrity": "sha512:AAA", "os": ["!linux", "!macos"]}}"#,
    );

    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();
    let store_dir = root.path().join("store");

    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_none(), "unexpected error: {:?}", report.error);
    assert_eq!(report.plan.skipped_platform, 1);
    assert_eq!(report.plan.real, 0);
    assert!(!project_dir.join("node_modules/win-only").exists());
}

/// Scenario 6: one placement's staging directory is blocked by a
/// pre-existing non-directory at that path -> that placement's
/// materialization fails before any swap, the run reports the error, and
/// the placement processed just before it (already swapped into place)
/// is left exactly as it landed.
#[tokio::test]
async fn materialize_failure_leaves_no_partial_tree_for_the_failed_placement() {
    let tarball_a = common::build_tarball(&[("index.js", b"a-content", false)]);
    let integrity_a = common::sha512_integrity(&tarball_a);
    let tarball_z = common::build_tarball(&[("index.js", b"z-content", false)]);
    let integrity_z = common::sha512_integrity(&tarball_z);

    let mut files = HashMap::new();
    files.insert("/a-1.0.0.tgz".to_string(), tarball_a);
    files.insert("/z-1.0.0.tgz".to_string(), tarball_z);
    let server = common::TestServer::start(files).await;

    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        &format!(
            r#"{{
                "node_modules/a": {{"name": "a", "version": "1.0.0",
                    "resolved": "{}", "integrity": "{integrity_a}"}},
                "node_modules/z": {{"name": "z", "version": "1.0.0",
                    "resolved": "{}", "integrity": "{integrity_z}"}}
            }}"#,
            server.url_for("/a-1.0.0.tgz"),
            server.url_for("/z-1.0.0.tgz"),
        ),
    );

    let project_dir = root.path().join("project");
    // "a" sorts before "z" at the same depth, so it materializes first.
    // Pre-seed "z"'s staging path as a plain file: its own
    // materialization can never turn that path into a directory, so its
    // swap never happens, while "a" (processed earlier, using its own
    // distinct staging path) is unaffected.
    std::fs::create_dir_all(project_dir.join("node_modules")).unwrap();
    std::fs::write(project_dir.join("node_modules/.staging-z"), b"blocker").unwrap();

    let store_dir = root.path().join("store");
    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_some());
    assert_eq!(report.error.as_ref().unwrap().kind, "MaterializeFailed");

    assert_eq!(
        std::fs::read_to_string(project_dir.join("node_modules/a/index.js")).unwrap(),
        "a-content"
    );
    assert!(!project_dir.join("node_modules/z").exists());
}

/// Boundary: duplicate install paths are rejected before any network I/O.
#[tokio::test]
async fn duplicate_install_paths_conflict_before_fetch() {
    // The lockfile JSON map itself cannot have duplicate keys, so we
    // exercise the normalized-path collision instead: two distinct raw
    // keys that normalize to the same install path.
    let root = tempfile::tempdir().unwrap();
    let lockfile_path = root.path().join("corepm.lock.json");
    common::write_lockfile(
        &lockfile_path,
        r#"{
            "node_modules/a": {"name": "a", "version": "1.0.0", "integrity": "sha512:AAA"},
            "node_modules/a/": {"name": "a-dup", "version": "1.0.0", "integrity": "sha512:BBB"}
        }"#,
    );

    let project_dir = root.path().join("project");
    std::fs::create_dir_all(&project_dir).unwrap();
    let store_dir = root.path().join("store");

    let report = install(&project_dir, &lockfile_path, base_config(store_dir)).await;

    assert!(report.error.is_some());
    assert_eq!(report.error.as_ref().unwrap().kind, "LockfileConflict");
}
