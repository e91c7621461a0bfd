use gitgov::core::crypto::Signer;
use gitgov::core::error::GitgovError;
use gitgov::core::identity::{FsKeyProvider, create_actor};
use gitgov::core::schemas::{ActorType, RecordType, TaskPriority, TaskRecord, TaskStatus};
use gitgov::core::store::{GITGOV_DIR, RecordStore, generate_id};
use gitgov::core::time::now_epoch_secs;
use gitgov::plugins::indexer::IndexerEngine;
use gitgov::plugins::sync::{PushOptions, SyncEngine};
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

const ACTOR: &str = "human:ada";

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A bare remote and one clone wired to it.
fn repo_with_remote(root: &Path, name: &str) -> std::path::PathBuf {
    let remote = root.join("remote.git");
    if !remote.exists() {
        git(root, &["init", "-q", "--bare", "remote.git"]);
    }
    let work = root.join(name);
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init", "-q"]);
    git(&work, &["remote", "add", "origin", &remote.to_string_lossy()]);
    work
}

fn seed(work: &Path) -> Signer {
    seed_as(work, "ada")
}

fn seed_as(work: &Path, name: &str) -> Signer {
    let store = RecordStore::for_project(work);
    store.init().unwrap();
    let keys = FsKeyProvider::new(&store);
    let (_, signer) = create_actor(&store, &keys, ActorType::Human, name, &["developer"]).unwrap();
    signer
}

fn add_task(store: &RecordStore, signer: &Signer, title: &str) -> String {
    let id = generate_id(RecordType::Task, title, now_epoch_secs());
    store
        .create(
            TaskRecord {
                id: id.clone(),
                title: title.to_string(),
                status: TaskStatus::Draft,
                priority: TaskPriority::Low,
                description: String::new(),
                tags: vec![],
                references: vec![],
                cycle_ids: vec![],
                notes: None,
            },
            signer,
        )
        .unwrap();
    id
}

fn push(engine: &SyncEngine, dry_run: bool) -> Result<gitgov::plugins::sync::PushResult, GitgovError> {
    push_as(engine, ACTOR, dry_run)
}

fn push_as(
    engine: &SyncEngine,
    actor: &str,
    dry_run: bool,
) -> Result<gitgov::plugins::sync::PushResult, GitgovError> {
    engine.push_state(&PushOptions {
        actor_id: actor.to_string(),
        dry_run,
    })
}

#[test]
fn dry_run_push_leaves_pending_changes_alone() {
    let tmp = tempdir().unwrap();
    let work = repo_with_remote(tmp.path(), "a");
    let signer = seed(&work);
    let engine = SyncEngine::for_project(&work).unwrap();
    add_task(engine.store(), &signer, "First task");

    let before = engine.get_pending_changes().unwrap();
    assert_eq!(before.len(), 2);
    let dry = push(&engine, true).unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.changes, before);
    assert_eq!(engine.get_pending_changes().unwrap(), before);

    let real = push(&engine, false).unwrap();
    assert!(real.pushed);
    assert!(real.commit.is_some());
    assert!(engine.get_pending_changes().unwrap().is_empty());

    let noop = push(&engine, false).unwrap();
    assert!(noop.success);
    assert!(noop.commit.is_none());
    assert!(noop.changes.is_empty());

    let remote_tip = git(
        &tmp.path().join("remote.git"),
        &["rev-parse", "refs/heads/gitgov-state"],
    );
    assert_eq!(Some(remote_tip), real.commit);
}

#[test]
fn working_branch_is_untouched_by_sync() {
    let tmp = tempdir().unwrap();
    let work = repo_with_remote(tmp.path(), "a");
    std::fs::write(work.join("README.md"), "hello\n").unwrap();
    git(&work, &["add", "README.md"]);
    git(
        &work,
        &["-c", "user.name=t", "-c", "user.email=t@example.com", "commit", "-q", "-m", "init"],
    );
    let head = git(&work, &["rev-parse", "HEAD"]);
    let branch = git(&work, &["rev-parse", "--abbrev-ref", "HEAD"]);

    let signer = seed(&work);
    let engine = SyncEngine::for_project(&work).unwrap();
    add_task(engine.store(), &signer, "Isolated");
    push(&engine, false).unwrap();

    assert_eq!(git(&work, &["rev-parse", "HEAD"]), head);
    assert_eq!(git(&work, &["rev-parse", "--abbrev-ref", "HEAD"]), branch);
    assert_eq!(git(&work, &["status", "--porcelain", "--untracked-files=no"]), "");
    assert_eq!(git(&work, &["ls-files"]), "README.md");
}

#[test]
fn bootstrap_restores_records_from_remote_and_invalidates_cache() {
    let tmp = tempdir().unwrap();
    let a = repo_with_remote(tmp.path(), "a");
    let signer = seed(&a);
    let engine_a = SyncEngine::for_project(&a).unwrap();
    let task = add_task(engine_a.store(), &signer, "Shared work");
    IndexerEngine::for_store(engine_a.store().clone())
        .unwrap()
        .generate_index()
        .unwrap();
    push(&engine_a, false).unwrap();

    let b = repo_with_remote(tmp.path(), "b");
    assert!(!b.join(GITGOV_DIR).exists());
    let engine_b = SyncEngine::for_project(&b).unwrap();
    let result = engine_b.bootstrap_from_state_branch().unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.source.as_deref(), Some("remote"));

    let store_b = engine_b.store();
    assert!(store_b.read::<TaskRecord>(&task).unwrap().is_some());
    assert!(!store_b.root.join("keys").exists());

    let indexer = IndexerEngine::for_store(store_b.clone()).unwrap();
    assert!(!indexer.is_index_up_to_date().unwrap());
    indexer.generate_index().unwrap();
    assert!(indexer.is_index_up_to_date().unwrap());
}

#[test]
fn bootstrap_fails_closed_without_a_state_branch() {
    let tmp = tempdir().unwrap();
    let work = repo_with_remote(tmp.path(), "a");
    let engine = SyncEngine::for_project(&work).unwrap();
    let result = engine.bootstrap_from_state_branch().unwrap();
    assert!(!result.success);
    assert!(result.error.is_some());
    assert!(!work.join(GITGOV_DIR).join("tasks").exists());
}

#[test]
fn divergence_gates_push_until_resolved() {
    let tmp = tempdir().unwrap();
    let a = repo_with_remote(tmp.path(), "a");
    let signer = seed(&a);
    let engine_a = SyncEngine::for_project(&a).unwrap();
    push(&engine_a, false).unwrap();

    let b = repo_with_remote(tmp.path(), "b");
    let engine_b = SyncEngine::for_project(&b).unwrap();
    assert!(engine_b.bootstrap_from_state_branch().unwrap().success);

    let from_a = add_task(engine_a.store(), &signer, "Made in a");
    push(&engine_a, false).unwrap();
    let from_b = add_task(engine_b.store(), &signer, "Made in b");

    let pulled = engine_b.pull_state().unwrap();
    assert!(pulled.conflict);
    assert!(!pulled.success);
    assert!(pulled.local_commit.is_some());
    assert!(engine_b.is_rebase_in_progress().unwrap());

    let err = push(&engine_b, false).unwrap_err();
    assert!(matches!(err, GitgovError::SyncConflict(_)));
    assert!(matches!(engine_b.pull_state(), Err(GitgovError::SyncConflict(_))));

    let resolved = engine_b.resolve().unwrap();
    assert!(resolved.success);
    assert!(!engine_b.is_rebase_in_progress().unwrap());
    assert!(engine_b.store().read::<TaskRecord>(&from_a).unwrap().is_some());
    assert!(engine_b.store().read::<TaskRecord>(&from_b).unwrap().is_some());

    let pushed = push(&engine_b, false).unwrap();
    assert!(pushed.pushed);

    let pulled_a = engine_a.pull_state().unwrap();
    assert!(pulled_a.updated);
    assert!(engine_a.store().read::<TaskRecord>(&from_b).unwrap().is_some());
}

#[test]
fn pull_fast_forwards_and_removes_deleted_records() {
    let tmp = tempdir().unwrap();
    let a = repo_with_remote(tmp.path(), "a");
    let signer = seed(&a);
    let engine_a = SyncEngine::for_project(&a).unwrap();
    let doomed = add_task(engine_a.store(), &signer, "Short lived");
    push(&engine_a, false).unwrap();

    let b = repo_with_remote(tmp.path(), "b");
    let engine_b = SyncEngine::for_project(&b).unwrap();
    assert!(engine_b.bootstrap_from_state_branch().unwrap().success);
    assert!(engine_b.store().read::<TaskRecord>(&doomed).unwrap().is_some());

    engine_a.store().delete(RecordType::Task, &doomed).unwrap();
    push(&engine_a, false).unwrap();

    let pulled = engine_b.pull_state().unwrap();
    assert!(pulled.success);
    assert!(pulled.updated);
    assert!(!pulled.conflict);
    assert!(engine_b.store().read::<TaskRecord>(&doomed).unwrap().is_none());
}

#[test]
fn unsynced_local_tree_never_overwrites_the_remote() {
    let tmp = tempdir().unwrap();
    let a = repo_with_remote(tmp.path(), "a");
    let ada = seed(&a);
    let engine_a = SyncEngine::for_project(&a).unwrap();
    let from_a = add_task(engine_a.store(), &ada, "Made in a");
    let published = push(&engine_a, false).unwrap().commit;

    // b starts its own tree instead of bootstrapping.
    let b = repo_with_remote(tmp.path(), "b");
    let bob = seed_as(&b, "bob");
    let engine_b = SyncEngine::for_project(&b).unwrap();
    let from_b = add_task(engine_b.store(), &bob, "Made in b");

    let err = push_as(&engine_b, "human:bob", false).unwrap_err();
    assert!(matches!(err, GitgovError::SyncConflict(_)));
    let remote_tip = git(
        &tmp.path().join("remote.git"),
        &["rev-parse", "refs/heads/gitgov-state"],
    );
    assert_eq!(Some(remote_tip), published);

    let pulled_a = engine_a.pull_state().unwrap();
    assert!(!pulled_a.updated);
    assert!(engine_a.store().read::<TaskRecord>(&from_a).unwrap().is_some());

    let pulled_b = engine_b.pull_state().unwrap();
    assert!(pulled_b.conflict);
    assert!(engine_b.is_rebase_in_progress().unwrap());
    let resolved = engine_b.resolve().unwrap();
    assert!(resolved.success);
    for id in [&from_a, &from_b] {
        assert!(engine_b.store().read::<TaskRecord>(id).unwrap().is_some());
    }
    assert!(push_as(&engine_b, "human:bob", false).unwrap().pushed);

    let merged = engine_a.pull_state().unwrap();
    assert!(merged.updated);
    assert!(!merged.conflict);
    for id in [&from_a, &from_b] {
        assert!(engine_a.store().read::<TaskRecord>(id).unwrap().is_some());
    }
    assert!(
        engine_a
            .store()
            .read::<gitgov::core::schemas::ActorRecord>("human:bob")
            .unwrap()
            .is_some()
    );
}
