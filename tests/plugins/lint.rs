use gitgov::core::crypto::{self, Signer};
use gitgov::core::error::GitgovError;
use gitgov::core::identity::{
    FsKeyProvider, IdentityResolver, KEYS_DIR, KeyProvider, StoreIdentityResolver, create_actor,
};
use gitgov::core::schemas::{
    ActorType, CycleRecord, CycleStatus, RecordType, Signature, TaskPriority, TaskRecord,
    TaskStatus,
};
use gitgov::core::store::{AUTHOR_ROLE, RecordStore, generate_id};
use gitgov::core::time::now_epoch_secs;
use gitgov::plugins::lint::{
    BACKUPS_DIR, FixOptions, LintEngine, LintLevel, LintOptions, LintValidator,
};
use serde_json::Value;
use std::fs;
use std::path::Path;
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

fn engine(store: &RecordStore) -> LintEngine {
    let identity: Arc<dyn IdentityResolver> = Arc::new(StoreIdentityResolver::new(
        store.clone(),
        Some("human:ada".to_string()),
    ));
    let keys: Arc<dyn KeyProvider> = Arc::new(FsKeyProvider::new(store));
    LintEngine::new(store.clone(), identity, keys)
}

fn task(id: &str, title: &str) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: title.to_string(),
        status: TaskStatus::Ready,
        priority: TaskPriority::Medium,
        description: String::new(),
        tags: vec![],
        references: vec![],
        cycle_ids: vec![],
        notes: None,
    }
}

fn add_task(p: &Project, title: &str) -> String {
    let id = generate_id(RecordType::Task, title, now_epoch_secs());
    p.store.create(task(&id, title), &p.signer).unwrap();
    id
}

fn corrupt_checksum(store: &RecordStore, id: &str) {
    let mut envelope = store.read::<TaskRecord>(id).unwrap().unwrap();
    envelope.header.payload_checksum = "deadbeef".to_string();
    store.write(&envelope).unwrap();
}

fn validators_for(report: &gitgov::plugins::lint::LintReport, file: &str) -> Vec<LintValidator> {
    report
        .results
        .iter()
        .filter(|r| r.file_path == file)
        .map(|r| r.validator)
        .collect()
}

fn task_rel(id: &str) -> String {
    format!("tasks/{}.json", id)
}

fn count_files(dir: &Path) -> usize {
    if !dir.is_dir() {
        return 0;
    }
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .map(|p| if p.is_dir() { count_files(&p) } else { 1 })
        .sum()
}

#[test]
fn independent_violations_are_all_reported() {
    let p = project();
    let id = generate_id(RecordType::Task, "Dangling", now_epoch_secs());
    let mut t = task(&id, "Dangling");
    t.references = vec!["task:1700000000-task-ghost".to_string()];
    p.store.create(t, &p.signer).unwrap();
    corrupt_checksum(&p.store, &id);

    let report = engine(&p.store).lint(&LintOptions::default()).unwrap();
    let found = validators_for(&report, &task_rel(&id));
    assert!(found.contains(&LintValidator::ChecksumVerification));
    assert!(found.contains(&LintValidator::ReferentialIntegrity));
    assert_eq!(report.summary.files_checked, 2);
    assert!(report.summary.errors >= 1);
    assert!(report.summary.warnings >= 1);
}

#[test]
fn fix_backs_up_once_and_reports_unfixable() {
    let p = project();
    let id = generate_id(RecordType::Task, "Half broken", now_epoch_secs());
    let mut t = task(&id, "Half broken");
    t.references = vec!["task:1700000000-task-ghost".to_string()];
    p.store.create(t, &p.signer).unwrap();
    corrupt_checksum(&p.store, &id);

    let lint = engine(&p.store);
    let report = lint.lint(&LintOptions::default()).unwrap();
    let fix = lint.fix(&report, &FixOptions::default()).unwrap();

    assert_eq!(fix.summary.fixed, 1);
    assert_eq!(fix.summary.failed, 1);
    assert_eq!(fix.summary.backups_created, 1);
    assert_eq!(count_files(&p.store.root.join(BACKUPS_DIR)), 1);

    let failed = fix.fixes.iter().find(|f| !f.success).unwrap();
    assert_eq!(failed.validator, LintValidator::ReferentialIntegrity);
    assert!(failed.error.as_deref().is_some_and(|e| !e.is_empty()));

    let repaired = p.store.read::<TaskRecord>(&id).unwrap().unwrap();
    assert_eq!(
        repaired.header.payload_checksum,
        crypto::checksum_of(&repaired.payload).unwrap()
    );
    assert_eq!(repaired.latest_signature().unwrap().role, "repair");

    let after = lint.lint(&LintOptions::default()).unwrap();
    let found = validators_for(&after, &task_rel(&id));
    assert!(!found.contains(&LintValidator::ChecksumVerification));
    assert!(!found.contains(&LintValidator::SignatureStructure));
    assert!(found.contains(&LintValidator::ReferentialIntegrity));
}

#[test]
fn scoped_fix_attempts_only_selected_validator() {
    let p = project();
    let mut signed = Vec::new();
    for title in ["sig one", "sig two", "sig three"] {
        let id = add_task(&p, title);
        signed.push(id.clone());
        let mut envelope = p.store.read::<TaskRecord>(&id).unwrap().unwrap();
        envelope.header.signatures.push(Signature {
            key_id: "human:ada".to_string(),
            role: "reviewer".to_string(),
            timestamp: now_epoch_secs(),
            signature: "not-a-signature".to_string(),
            notes: None,
        });
        p.store.write(&envelope).unwrap();
    }
    for title in ["schema one", "schema two"] {
        let id = add_task(&p, title);
        let path = p.store.record_path(RecordType::Task, &id);
        let mut doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["payload"].as_object_mut().unwrap().remove("tags");
        let checksum = crypto::compute_checksum(&doc["payload"]);
        let sig = p.signer.sign(&checksum, AUTHOR_ROLE, None);
        doc["header"]["payloadChecksum"] = Value::String(checksum);
        doc["header"]["signatures"] = serde_json::to_value(vec![sig]).unwrap();
        fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    let lint = engine(&p.store);
    let report = lint.lint(&LintOptions::default()).unwrap();
    let count = |v: LintValidator| {
        report
            .results
            .iter()
            .filter(|r| r.validator == v && r.fixable)
            .count()
    };
    assert_eq!(count(LintValidator::SignatureStructure), 3);
    assert_eq!(count(LintValidator::SchemaValidation), 2);

    let fix = lint
        .fix(
            &report,
            &FixOptions {
                fix_types: Some(vec![LintValidator::SignatureStructure]),
                dry_run: false,
            },
        )
        .unwrap();
    assert_eq!(fix.fixes.len(), 3);
    assert!(fix
        .fixes
        .iter()
        .all(|f| f.validator == LintValidator::SignatureStructure));
    assert!(fix.summary.fixed <= 3);

    // The malformed entry stays in the trail under the appended repair.
    for id in &signed {
        let repaired = p.store.read::<TaskRecord>(id).unwrap().unwrap();
        let roles: Vec<&str> = repaired
            .header
            .signatures
            .iter()
            .map(|s| s.role.as_str())
            .collect();
        assert_eq!(roles, vec![AUTHOR_ROLE, "reviewer", "repair"]);
    }

    let after = lint.lint(&LintOptions::default()).unwrap();
    let leftover: Vec<_> = after
        .results
        .iter()
        .filter(|r| r.validator == LintValidator::SignatureStructure)
        .collect();
    assert_eq!(leftover.len(), 3);
    assert!(leftover
        .iter()
        .all(|r| r.level == LintLevel::Warning && !r.fixable));
    assert_eq!(
        after
            .results
            .iter()
            .filter(|r| r.validator == LintValidator::SchemaValidation)
            .count(),
        2
    );
}

#[test]
fn dry_run_plans_without_writing() {
    let p = project();
    let id = add_task(&p, "Dry");
    corrupt_checksum(&p.store, &id);
    let path = p.store.record_path(RecordType::Task, &id);
    let before = fs::read_to_string(&path).unwrap();

    let lint = engine(&p.store);
    let report = lint.lint(&LintOptions::default()).unwrap();
    let fix = lint
        .fix(
            &report,
            &FixOptions {
                fix_types: None,
                dry_run: true,
            },
        )
        .unwrap();
    assert!(fix.fixes.iter().any(|f| f.success));
    assert_eq!(fix.summary.backups_created, 0);
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
    assert!(!p.store.root.join(BACKUPS_DIR).exists());
}

#[test]
fn legacy_schema_version_is_detected_and_migrated() {
    let p = project();
    let id = add_task(&p, "Old format");
    let mut envelope = p.store.read::<TaskRecord>(&id).unwrap().unwrap();
    envelope.header.schema_version = "1.0".to_string();
    p.store.write(&envelope).unwrap();

    let lint = engine(&p.store);
    let migrations = lint.detect_migrations().unwrap();
    assert_eq!(migrations.results.len(), 1);
    let result = &migrations.results[0];
    assert_eq!(result.validator, LintValidator::SchemaVersionMismatch);
    assert_eq!(result.level, LintLevel::Warning);
    assert!(result.fixable);

    let fix = lint.fix(&migrations, &FixOptions::default()).unwrap();
    assert_eq!(fix.summary.fixed, 1);
    let migrated = p.store.read::<TaskRecord>(&id).unwrap().unwrap();
    assert_eq!(migrated.header.schema_version, "1.1");
    assert!(lint.detect_migrations().unwrap().results.is_empty());
}

#[test]
fn one_sided_cycle_link_is_repaired_on_the_cycle() {
    let p = project();
    let now = now_epoch_secs();
    let cycle_id = generate_id(RecordType::Cycle, "Sprint one", now);
    p.store
        .create(
            CycleRecord {
                id: cycle_id.clone(),
                title: "Sprint one".to_string(),
                status: CycleStatus::Active,
                task_ids: vec![],
                child_cycle_ids: vec![],
                tags: vec![],
                notes: None,
            },
            &p.signer,
        )
        .unwrap();
    let task_id = generate_id(RecordType::Task, "Planned work", now);
    let mut t = task(&task_id, "Planned work");
    t.cycle_ids = vec![cycle_id.clone()];
    p.store.create(t, &p.signer).unwrap();

    let lint = engine(&p.store);
    let report = lint.lint(&LintOptions::default()).unwrap();
    let link = report
        .results
        .iter()
        .find(|r| r.validator == LintValidator::BidirectionalConsistency)
        .unwrap();
    assert_eq!(link.file_path, format!("cycles/{}.json", cycle_id));
    assert_eq!(link.target.as_deref(), Some(task_id.as_str()));

    let fix = lint
        .fix(
            &report,
            &FixOptions {
                fix_types: Some(vec![LintValidator::BidirectionalConsistency]),
                dry_run: false,
            },
        )
        .unwrap();
    assert_eq!(fix.summary.fixed, 1);
    let cycle = p.store.read::<CycleRecord>(&cycle_id).unwrap().unwrap();
    assert_eq!(cycle.payload.task_ids, vec![task_id]);

    let after = lint.lint(&LintOptions::default()).unwrap();
    assert!(after.results.is_empty(), "{:?}", after.results);
}

#[test]
fn missing_key_fails_only_signing_fixes() {
    let p = project();
    let broken = add_task(&p, "Needs resign");
    corrupt_checksum(&p.store, &broken);
    let misnamed = add_task(&p, "Wrong file name");
    let right = p.store.record_path(RecordType::Task, &misnamed);
    let wrong = right.with_file_name("misnamed.json");
    fs::rename(&right, &wrong).unwrap();
    fs::remove_dir_all(p.store.root.join(KEYS_DIR)).unwrap();

    let lint = engine(&p.store);
    let report = lint.lint(&LintOptions::default()).unwrap();
    let fix = lint
        .fix(
            &report,
            &FixOptions {
                fix_types: Some(vec![
                    LintValidator::ChecksumVerification,
                    LintValidator::FileNaming,
                ]),
                dry_run: false,
            },
        )
        .unwrap();

    let checksum = fix
        .fixes
        .iter()
        .find(|f| f.validator == LintValidator::ChecksumVerification)
        .unwrap();
    assert!(!checksum.success);
    assert!(checksum.error.as_deref().unwrap_or("").contains("human:ada"));

    let naming = fix
        .fixes
        .iter()
        .find(|f| f.validator == LintValidator::FileNaming)
        .unwrap();
    assert!(naming.success);
    assert!(right.exists());
    assert!(!wrong.exists());
}

#[test]
fn lint_requires_an_initialized_store() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    let err = engine(&store).lint(&LintOptions::default()).unwrap_err();
    assert!(matches!(err, GitgovError::Uninitialized(_)));
}

#[test]
fn lint_file_checks_a_single_record() {
    let p = project();
    let good = add_task(&p, "Fine");
    let bad = add_task(&p, "Not fine");
    corrupt_checksum(&p.store, &bad);

    let lint = engine(&p.store);
    let clean = lint
        .lint_file(&p.store.record_path(RecordType::Task, &good), &LintOptions::default())
        .unwrap();
    assert_eq!(clean.summary.files_checked, 1);
    assert!(clean.results.is_empty());

    let dirty = lint
        .lint_file(&p.store.record_path(RecordType::Task, &bad), &LintOptions::default())
        .unwrap();
    assert_eq!(dirty.summary.errors, 1);
    assert_eq!(dirty.results[0].validator, LintValidator::ChecksumVerification);
}
