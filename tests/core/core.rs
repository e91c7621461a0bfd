use gitgov::core::config::{self, GitgovConfig};
use gitgov::core::crypto::{self, Signer};
use gitgov::core::error::GitgovError;
use gitgov::core::identity::{
    FsKeyProvider, IdentityResolver, KeyProvider, StoreIdentityResolver, create_actor, signer_for,
};
use gitgov::core::integrity::check_envelope;
use gitgov::core::schemas::{
    ActorRecord, ActorType, RecordEnvelope, RecordType, TaskPriority, TaskRecord, TaskStatus,
};
use gitgov::core::store::{self, RecordStore};
use serde_json::{Value, json};
use std::fs;
use tempfile::tempdir;

fn draft(id: &str, title: &str) -> TaskRecord {
    TaskRecord {
        id: id.to_string(),
        title: title.to_string(),
        status: TaskStatus::Draft,
        priority: TaskPriority::Medium,
        description: "from the planning session".to_string(),
        tags: vec!["core".to_string()],
        references: vec![],
        cycle_ids: vec![],
        notes: None,
    }
}

fn raw(envelope: &RecordEnvelope<TaskRecord>) -> RecordEnvelope<Value> {
    serde_json::from_value(serde_json::to_value(envelope).unwrap()).unwrap()
}

#[test]
fn checksum_ignores_key_order() {
    let a = json!({"id": "x", "tags": ["a", "b"], "nested": {"z": 1, "a": [true, null]}});
    let b = json!({"nested": {"a": [true, null], "z": 1}, "tags": ["a", "b"], "id": "x"});
    assert_eq!(crypto::compute_checksum(&a), crypto::compute_checksum(&b));
    assert_eq!(crypto::compute_checksum(&a).len(), 64);

    let reordered = json!({"id": "x", "tags": ["b", "a"], "nested": {"z": 1, "a": [true, null]}});
    assert_ne!(crypto::compute_checksum(&a), crypto::compute_checksum(&reordered));
}

#[test]
fn any_payload_edit_breaks_the_latest_signature() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    store.init().unwrap();
    let keys = FsKeyProvider::new(&store);
    let (_, signer) = create_actor(&store, &keys, ActorType::Human, "ada", &["developer"]).unwrap();
    let identity = StoreIdentityResolver::new(store.clone(), None);

    let id = store::generate_id(RecordType::Task, "Tamper target", 1_700_000_000);
    let envelope = store.create(draft(&id, "Tamper target"), &signer).unwrap();
    assert!(check_envelope(&raw(&envelope), &identity).unwrap().is_clean());

    let mut edited = raw(&envelope);
    edited.payload["title"] = Value::String("Tamper targeT".to_string());
    let check = check_envelope(&edited, &identity).unwrap();
    assert!(!check.checksum_ok);
    assert!(!check.signatures_ok());

    // Re-stamping the checksum alone does not make the old signature valid.
    edited.header.payload_checksum = crypto::compute_checksum(&edited.payload);
    let check = check_envelope(&edited, &identity).unwrap();
    assert!(check.checksum_ok);
    assert!(!check.signatures_ok());
}

#[test]
fn transitions_append_signatures_and_keep_history() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    store.init().unwrap();
    let keys = FsKeyProvider::new(&store);
    let (_, author) = create_actor(&store, &keys, ActorType::Human, "ada", &["developer"]).unwrap();
    let (_, reviewer) = create_actor(&store, &keys, ActorType::Agent, "review bot", &["reviewer"]).unwrap();
    assert_eq!(reviewer.actor_id, "agent:review-bot");

    let id = store::generate_id(RecordType::Task, "Lifecycle", 1_700_000_000);
    let created = store.create(draft(&id, "Lifecycle"), &author).unwrap();
    let mut next = created.payload.clone();
    next.status = TaskStatus::Review;
    let reviewed = store
        .transition(created, next, &reviewer, "reviewer", Some("looks right"))
        .unwrap();
    let approved = store.sign(reviewed, &author, "approver", None).unwrap();

    let on_disk = store.read::<TaskRecord>(&id).unwrap().unwrap();
    assert_eq!(on_disk, approved);
    let roles: Vec<&str> = on_disk.header.signatures.iter().map(|s| s.role.as_str()).collect();
    assert_eq!(roles, vec!["author", "reviewer", "approver"]);
    assert_eq!(on_disk.payload.status, TaskStatus::Review);

    let identity = StoreIdentityResolver::new(store.clone(), None);
    assert!(check_envelope(&raw(&on_disk), &identity).unwrap().is_clean());

    let err = store.create(draft(&id, "Lifecycle"), &author).unwrap_err();
    assert!(matches!(err, GitgovError::ValidationError(_)));
}

#[test]
fn actor_files_and_keys_use_portable_names() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    store.init().unwrap();
    let keys = FsKeyProvider::new(&store);
    create_actor(&store, &keys, ActorType::Human, "Grace Hopper", &["lead"]).unwrap();

    let path = store.record_path(RecordType::Actor, "human:grace-hopper");
    assert!(path.ends_with("actors/human_grace-hopper.json"));
    assert!(path.exists());
    assert_eq!(
        store.list_ids(RecordType::Actor).unwrap(),
        vec!["human:grace-hopper".to_string()]
    );

    let key = keys.get_private_key("human:grace-hopper").unwrap().unwrap();
    let actor = store.read::<ActorRecord>("human:grace-hopper").unwrap().unwrap();
    assert_eq!(
        crypto::encode_public_key(&key.verifying_key()),
        actor.payload.public_key
    );

    let err = signer_for(&keys, "human:nobody").unwrap_err();
    assert!(matches!(err, GitgovError::KeyUnavailable(_)));
}

#[test]
fn current_actor_comes_from_config() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    store.init().unwrap();
    let keys = FsKeyProvider::new(&store);
    create_actor(&store, &keys, ActorType::Human, "ada", &["developer"]).unwrap();

    let cfg = GitgovConfig {
        current_actor: Some("human:ada".to_string()),
        ..GitgovConfig::default()
    };
    config::save_config(&store.root, &cfg).unwrap();
    let loaded = config::load_config(&store.root).unwrap();
    assert_eq!(loaded.current_actor.as_deref(), Some("human:ada"));
    assert_eq!(loaded.sync.state_branch, "gitgov-state");

    let resolver = StoreIdentityResolver::new(store.clone(), loaded.current_actor.clone());
    assert_eq!(resolver.get_current_actor().unwrap().id, "human:ada");
    let nobody = StoreIdentityResolver::new(store, None);
    assert!(nobody.get_current_actor().is_err());
}

#[test]
fn ids_round_trip_through_file_stems() {
    let id = store::generate_id(RecordType::Cycle, "Q3 Planning: API!", 1_720_000_000);
    assert_eq!(id, "1720000000-cycle-q3-planning-api");
    assert!(store::is_valid_id(RecordType::Cycle, &id));
    assert!(!store::is_valid_id(RecordType::Task, &id));
    assert_eq!(store::id_epoch(&id), Some(1_720_000_000));
    assert!(store::is_valid_id(RecordType::Agent, "agent:triage"));
    assert!(!store::is_valid_id(RecordType::Actor, "robot:triage"));
    let stem = store::file_stem_for_id("agent:triage");
    assert_eq!(store::id_for_file_stem(RecordType::Agent, &stem), "agent:triage");
}

#[test]
fn envelope_files_are_pretty_json_with_newline() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::for_project(tmp.path());
    store.init().unwrap();
    let signer = Signer::new("human:ada", crypto::generate_keypair());
    let id = store::generate_id(RecordType::Task, "Format", 1_700_000_000);
    store.create(draft(&id, "Format"), &signer).unwrap();

    let content = fs::read_to_string(store.record_path(RecordType::Task, &id)).unwrap();
    assert!(content.ends_with('\n'));
    let doc: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(doc["header"]["recordType"], "task");
    assert_eq!(doc["header"]["schemaVersion"], "1.1");
    assert_eq!(doc["payload"]["cycleIds"], json!([]));
    assert_eq!(
        doc["header"]["payloadChecksum"].as_str().unwrap(),
        crypto::compute_checksum(&doc["payload"])
    );
}
