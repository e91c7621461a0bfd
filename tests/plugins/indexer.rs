use gitgov::core::config::IndexConfig;
use gitgov::core::crypto::{self, Signer};
use gitgov::core::identity::{FsKeyProvider, IdentityResolver, StoreIdentityResolver, create_actor};
use gitgov::core::schemas::{
    ActorType, ExecutionRecord, ExecutionType, FeedbackRecord, FeedbackStatus, FeedbackType,
    RecordType, TaskPriority, TaskRecord, TaskStatus,
};
use gitgov::core::store::{RecordStore, generate_id};
use gitgov::core::time::{SECS_PER_DAY, now_epoch_secs};
use gitgov::plugins::indexer::{IndexerEngine, IntegrityIssueKind, IntegrityStatus};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

struct Project {
    _tmp: tempfile::TempDir,
    store: RecordStore,
    signer: Signer,
}

fn project() -> Project {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    store.init().unwrap();
    let keys = FsKeyProvider::new(&store);
    let (_, signer) = create_actor(&store, &keys, ActorType::Human, "ada", &["developer"]).unwrap();
    Project {
        _tmp: tmp,
        store,
        signer,
    }
}

fn engine(store: &RecordStore) -> IndexerEngine {
    let identity: Arc<dyn IdentityResolver> =
        Arc::new(StoreIdentityResolver::new(store.clone(), None));
    IndexerEngine::new(store.clone(), IndexConfig::default(), identity)
}

fn add_task(p: &Project, title: &str, status: TaskStatus) -> String {
    let id = generate_id(RecordType::Task, title, now_epoch_secs());
    p.store
        .create(
            TaskRecord {
                id: id.clone(),
                title: title.to_string(),
                status,
                priority: TaskPriority::High,
                description: String::new(),
                tags: vec![],
                references: vec![],
                cycle_ids: vec![],
                notes: None,
            },
            &p.signer,
        )
        .unwrap();
    id
}

#[test]
fn corrupted_checksum_is_reported_as_error() {
    let p = project();
    let id = add_task(&p, "Write the parser", TaskStatus::Ready);
    add_task(&p, "Review the parser", TaskStatus::Ready);

    let mut envelope = p.store.read::<TaskRecord>(&id).unwrap().unwrap();
    envelope.header.payload_checksum = "deadbeef".to_string();
    p.store.write(&envelope).unwrap();

    let report = engine(&p.store).validate_integrity().unwrap();
    assert_eq!(report.status, IntegrityStatus::Errors);
    assert_eq!(report.checksum_failures, 1);
    assert_eq!(report.signature_failures, 0);
    assert_eq!(report.records_checked, 3);
    assert!(report.errors.iter().any(|e| e.entity_id.as_deref() == Some(id.as_str())));
    assert!(report.remediation.is_some());
}

#[test]
fn clean_store_validates() {
    let p = project();
    add_task(&p, "Ship it", TaskStatus::Draft);
    let report = engine(&p.store).validate_integrity().unwrap();
    assert_eq!(report.status, IntegrityStatus::Valid);
    assert!(report.errors.is_empty());
}

#[test]
fn active_tasks_without_activity_become_stalled() {
    let p = project();
    let a = add_task(&p, "Alpha", TaskStatus::Active);
    let b = add_task(&p, "Beta", TaskStatus::Active);
    add_task(&p, "Gamma", TaskStatus::Done);

    let later = now_epoch_secs() + 10 * SECS_PER_DAY;
    let report = engine(&p.store).with_clock(later).generate_index().unwrap();
    assert!(report.success);
    let snapshot = report.snapshot.unwrap();

    let mut stalled = snapshot.derived_states.stalled_tasks.clone();
    stalled.sort();
    let mut expected = vec![a.clone(), b];
    expected.sort();
    assert_eq!(stalled, expected);

    let alpha = snapshot
        .enriched_tasks
        .iter()
        .find(|t| t.task.id == a)
        .unwrap();
    // 100 - 30 stalled - 10 active without executions
    assert_eq!(alpha.derived_state.health_score, 60);
    assert!(!alpha.derived_state.is_at_risk);

    let done = snapshot
        .enriched_tasks
        .iter()
        .find(|t| t.task.status == TaskStatus::Done)
        .unwrap();
    assert_eq!(done.derived_state.health_score, 100);
    assert!(!done.derived_state.is_stalled);
}

#[test]
fn feedback_and_executions_shape_enrichment() {
    let p = project();
    let task = add_task(&p, "Migrate storage", TaskStatus::Active);
    let now = now_epoch_secs();
    for (title, kind) in [
        ("Vendor outage", FeedbackType::Blocking),
        ("Which region", FeedbackType::Question),
    ] {
        p.store
            .create(
                FeedbackRecord {
                    id: generate_id(RecordType::Feedback, title, now),
                    entity_type: RecordType::Task,
                    entity_id: task.clone(),
                    feedback_type: kind,
                    status: FeedbackStatus::Open,
                    content: title.to_string(),
                    assignee: None,
                    resolves_feedback_id: None,
                },
                &p.signer,
            )
            .unwrap();
    }
    p.store
        .create(
            FeedbackRecord {
                id: generate_id(RecordType::Feedback, "assign ada", now),
                entity_type: RecordType::Task,
                entity_id: task.clone(),
                feedback_type: FeedbackType::Assignment,
                status: FeedbackStatus::Resolved,
                content: "taking this".to_string(),
                assignee: Some("human:ada".to_string()),
                resolves_feedback_id: None,
            },
            &p.signer,
        )
        .unwrap();
    p.store
        .create(
            ExecutionRecord {
                id: generate_id(RecordType::Execution, "first pass", now),
                task_id: task.clone(),
                execution_type: ExecutionType::Progress,
                title: "first pass".to_string(),
                result: "schema drafted".to_string(),
                notes: None,
                references: vec![],
            },
            &p.signer,
        )
        .unwrap();

    let report = engine(&p.store).with_clock(now).generate_index().unwrap();
    let snapshot = report.snapshot.unwrap();
    let enriched = &snapshot.enriched_tasks[0];
    assert_eq!(enriched.relationships.blocked_by.len(), 1);
    assert_eq!(enriched.relationships.assigned_to.as_deref(), Some("human:ada"));
    assert_eq!(enriched.metrics.execution_count, 1);
    assert!(enriched.derived_state.needs_clarification);
    assert!(enriched.derived_state.is_blocked_by_dependency);
    // 100 - 20 blocking - 10 question
    assert_eq!(enriched.derived_state.health_score, 70);
    assert_eq!(snapshot.metrics.open_feedback, 2);
    assert_eq!(snapshot.metrics.resolved_feedback, 1);
    assert_eq!(snapshot.metrics.total_executions, 1);
    assert!(snapshot.derived_states.needs_clarification_tasks.contains(&task));
}

#[test]
fn generation_is_deterministic_for_a_fixed_clock() {
    let p = project();
    add_task(&p, "One", TaskStatus::Active);
    add_task(&p, "Two", TaskStatus::Review);
    add_task(&p, "Three", TaskStatus::Ready);
    let now = now_epoch_secs() + SECS_PER_DAY;

    let first = engine(&p.store).with_clock(now).generate_index().unwrap().snapshot.unwrap();
    let second = engine(&p.store).with_clock(now).generate_index().unwrap().snapshot.unwrap();
    assert_eq!(first.tasks, second.tasks);
    assert_eq!(first.enriched_tasks, second.enriched_tasks);
    assert_eq!(first.derived_states, second.derived_states);
    assert_eq!(first.activity_history, second.activity_history);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(
        first.metadata.source_fingerprint,
        second.metadata.source_fingerprint
    );
}

#[test]
fn cache_goes_stale_when_records_change() {
    let p = project();
    add_task(&p, "Initial", TaskStatus::Draft);
    let indexer = engine(&p.store);
    assert!(!indexer.is_index_up_to_date().unwrap());

    indexer.generate_index().unwrap();
    assert!(indexer.is_index_up_to_date().unwrap());
    let cached = indexer.get_index_data().unwrap().unwrap();
    assert_eq!(cached.tasks.len(), 1);

    add_task(&p, "Follow up", TaskStatus::Draft);
    assert!(!indexer.is_index_up_to_date().unwrap());

    indexer.generate_index().unwrap();
    assert!(indexer.is_index_up_to_date().unwrap());
    assert!(indexer.invalidate_cache().unwrap());
    assert!(!indexer.is_index_up_to_date().unwrap());
    assert!(indexer.get_index_data().unwrap().is_none());
}

#[test]
fn unreadable_record_does_not_abort_generation() {
    let p = project();
    add_task(&p, "Good record", TaskStatus::Draft);
    fs::write(
        p.store.type_dir(RecordType::Task).join("1700000000-task-broken.json"),
        "{ not json",
    )
    .unwrap();

    let report = engine(&p.store).generate_index().unwrap();
    assert!(report.success);
    assert_eq!(report.errors.len(), 1);
    let snapshot = report.snapshot.unwrap();
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(snapshot.metadata.integrity_status, IntegrityStatus::Errors);
}

#[test]
fn malformed_actor_file_fails_only_its_signed_records() {
    let p = project();
    add_task(&p, "Still clean", TaskStatus::Ready);

    let mallory = Signer::new("human:mallory", crypto::generate_keypair());
    let id = generate_id(RecordType::Task, "Signed by mallory", now_epoch_secs());
    p.store
        .create(
            TaskRecord {
                id: id.clone(),
                title: "Signed by mallory".to_string(),
                status: TaskStatus::Draft,
                priority: TaskPriority::Low,
                description: String::new(),
                tags: vec![],
                references: vec![],
                cycle_ids: vec![],
                notes: None,
            },
            &mallory,
        )
        .unwrap();
    fs::write(
        p.store.record_path(RecordType::Actor, "human:mallory"),
        r#"{"header":1}"#,
    )
    .unwrap();

    let indexer = engine(&p.store);
    let report = indexer.validate_integrity().unwrap();
    assert_eq!(report.status, IntegrityStatus::Errors);
    assert_eq!(report.records_checked, 4);
    assert_eq!(report.signature_failures, 1);
    assert_eq!(report.schema_errors, 1);
    assert!(report.errors.iter().any(|e| {
        e.kind == IntegrityIssueKind::Actor && e.entity_id.as_deref() == Some(id.as_str())
    }));

    let generated = indexer.generate_index().unwrap();
    assert!(generated.success);
    assert_eq!(generated.snapshot.unwrap().tasks.len(), 2);
}

fn git(dir: &std::path::Path, args: &[&str]) -> String {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git should run");
    assert!(out.status.success(), "git {:?} failed", args);
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

#[test]
fn project_engine_records_the_state_branch_tip() {
    let p = project();
    add_task(&p, "Tracked", TaskStatus::Draft);
    let root = p.store.root.parent().unwrap().to_path_buf();

    let outside = IndexerEngine::for_project(&root).unwrap().generate_index().unwrap();
    assert_eq!(outside.snapshot.unwrap().metadata.last_commit_hash, None);

    git(&root, &["init", "-q"]);
    git(
        &root,
        &[
            "-c", "user.name=t", "-c", "user.email=t@example.com",
            "commit", "-q", "--allow-empty", "-m", "state",
        ],
    );
    git(&root, &["branch", "gitgov-state"]);
    let tip = git(&root, &["rev-parse", "gitgov-state"]);

    let report = IndexerEngine::for_project(&root).unwrap().generate_index().unwrap();
    assert_eq!(report.snapshot.unwrap().metadata.last_commit_hash, Some(tip));
}
