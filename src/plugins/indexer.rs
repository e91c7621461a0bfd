//! Index/cache engine.
//!
//! Derives a queryable snapshot (enriched tasks, derived-state groupings,
//! activity history, counts) from the record store in one full pass and
//! persists it to `.gitgov/index.json` through a temp file and rename. The
//! snapshot is keyed by a stat-only fingerprint of the record files, so
//! staleness is a comparison rather than a rebuild.
//!
//! `validate_integrity` never consults the cache: it re-reads every record,
//! recomputes every checksum and re-verifies signatures.

use crate::core::config::{self, IndexConfig};
use crate::core::error::GitgovError;
use crate::core::git::{GitPrimitives, SystemGitExecutor};
use crate::core::identity::{IdentityResolver, StoreIdentityResolver};
use crate::core::integrity;
use crate::core::output;
use crate::core::schemas::{
    ActorRecord, AnyPayload, CycleRecord, FeedbackRecord, FeedbackType, RecordType, TaskPriority,
    TaskRecord, TaskStatus,
};
use crate::core::store::{self, RawRecord, RecordStore};
use crate::core::time;
use clap::Parser;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

pub const INDEX_FILE: &str = "index.json";

const STALLED_PENALTY: i64 = 30;
const BLOCKING_PENALTY: i64 = 20;
const BLOCKING_PENALTY_CAP: i64 = 40;
const QUESTION_PENALTY: i64 = 10;
const QUESTION_PENALTY_CAP: i64 = 20;
const IDLE_ACTIVE_PENALTY: i64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    #[default]
    Valid,
    Warnings,
    Errors,
}

impl IntegrityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntegrityStatus::Valid => "valid",
            IntegrityStatus::Warnings => "warnings",
            IntegrityStatus::Errors => "errors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityIssueKind {
    Checksum,
    Signature,
    Schema,
    Reference,
    Actor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub kind: IntegrityIssueKind,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub records_checked: usize,
    pub checksum_failures: usize,
    pub signature_failures: usize,
    pub schema_errors: usize,
    pub reference_errors: usize,
    pub errors: Vec<IntegrityIssue>,
    pub warnings: Vec<IntegrityIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    TaskCreated,
    TaskModified,
    CycleCreated,
    FeedbackCreated,
    ExecutionAdded,
    ChangelogAdded,
    ActorCreated,
    AgentRegistered,
}

impl ActivityType {
    fn for_creation(record_type: RecordType) -> Self {
        match record_type {
            RecordType::Task => ActivityType::TaskCreated,
            RecordType::Cycle => ActivityType::CycleCreated,
            RecordType::Feedback => ActivityType::FeedbackCreated,
            RecordType::Execution => ActivityType::ExecutionAdded,
            RecordType::Changelog => ActivityType::ChangelogAdded,
            RecordType::Actor => ActivityType::ActorCreated,
            RecordType::Agent => ActivityType::AgentRegistered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedState {
    pub is_stalled: bool,
    pub is_at_risk: bool,
    pub needs_clarification: bool,
    pub is_blocked_by_dependency: bool,
    pub health_score: u32,
    /// Days since the task's latest signature.
    pub time_in_current_stage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRelationships {
    pub assigned_to: Option<String>,
    pub depends_on: Vec<String>,
    pub blocked_by: Vec<String>,
    pub cycles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub execution_count: usize,
    pub blocking_feedback_count: usize,
    pub open_question_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTask {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub derived_state: DerivedState,
    pub relationships: TaskRelationships,
    pub metrics: TaskMetrics,
    pub last_updated: u64,
    pub last_activity_type: ActivityType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedStates {
    pub stalled_tasks: Vec<String>,
    pub at_risk_tasks: Vec<String>,
    pub needs_clarification_tasks: Vec<String>,
    pub blocked_by_dependency_tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub entity_type: RecordType,
    pub entity_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetrics {
    pub total_tasks: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub tasks_by_priority: BTreeMap<String, usize>,
    pub cycles_by_status: BTreeMap<String, usize>,
    pub open_feedback: usize,
    pub resolved_feedback: usize,
    pub total_executions: usize,
    pub total_changelogs: usize,
    pub average_health_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub generated_at: u64,
    pub last_commit_hash: Option<String>,
    pub source_fingerprint: String,
    pub integrity_status: IntegrityStatus,
    pub record_counts: BTreeMap<String, usize>,
    /// Milliseconds spent reading and deriving.
    pub generation_time: u64,
}

/// The derived view. Only `IndexerEngine::generate_index` builds one, always
/// from a full scan; it is replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    pub metadata: IndexMetadata,
    pub tasks: Vec<TaskRecord>,
    pub enriched_tasks: Vec<EnrichedTask>,
    pub cycles: Vec<CycleRecord>,
    pub actors: Vec<ActorRecord>,
    pub feedback: Vec<FeedbackRecord>,
    pub derived_states: DerivedStates,
    pub activity_history: Vec<ActivityEvent>,
    pub metrics: IndexMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub read_time: u64,
    pub calculation_time: u64,
    pub write_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexGenerationReport {
    /// The cache artifact was written.
    pub success: bool,
    pub records_processed: usize,
    pub metrics_calculated: usize,
    pub generation_time: u64,
    pub cache_size: u64,
    /// Records skipped or write failures; empty, never absent, on success.
    pub errors: Vec<String>,
    pub performance: PhaseTimings,
    #[serde(skip)]
    pub snapshot: Option<IndexSnapshot>,
}

/// Only the part of the cache needed to answer staleness questions.
#[derive(Deserialize)]
struct CacheHead {
    metadata: IndexMetadata,
}

struct LoadedRecord {
    raw: RawRecord,
    rel_path: String,
    payload: Result<AnyPayload, String>,
}

#[derive(Default)]
struct LoadedStore {
    records: Vec<LoadedRecord>,
    /// `(relative path, message)` for files that are not envelopes at all.
    failures: Vec<(String, String)>,
    /// Ids per type as encoded in file names, for reference resolution.
    listed_ids: FxHashMap<RecordType, FxHashSet<String>>,
}

pub struct IndexerEngine {
    store: RecordStore,
    config: IndexConfig,
    identity: Arc<dyn IdentityResolver>,
    git: Option<(GitPrimitives, String)>,
    clock: Option<u64>,
}

impl IndexerEngine {
    pub fn new(store: RecordStore, config: IndexConfig, identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            store,
            config,
            identity,
            git: None,
            clock: None,
        }
    }

    /// Engine with the project's configuration and store-backed identity.
    pub fn for_store(store: RecordStore) -> Result<Self, GitgovError> {
        let cfg = config::load_config(&store.root)?;
        let identity = Arc::new(StoreIdentityResolver::from_config(store.clone(), &cfg));
        Ok(Self::new(store, cfg.index, identity))
    }

    /// `for_store` on the project's `.gitgov/`, with the state branch of the
    /// enclosing git repository attached when there is one.
    pub fn for_project(project_root: &Path) -> Result<Self, GitgovError> {
        let store = RecordStore::for_project(project_root);
        let cfg = config::load_config(&store.root)?;
        let engine = Self::for_store(store)?;
        let timeout = Duration::from_secs(cfg.sync.git_timeout_secs);
        match GitPrimitives::discover(Arc::new(SystemGitExecutor), project_root, timeout) {
            Ok(git) => Ok(engine.with_git(git, cfg.sync.state_branch)),
            Err(e) => {
                tracing::debug!(error = %e, "not a git repository; lastCommitHash stays empty");
                Ok(engine)
            }
        }
    }

    /// Record the state-branch tip as `metadata.lastCommitHash`.
    pub fn with_git(mut self, git: GitPrimitives, state_branch: impl Into<String>) -> Self {
        self.git = Some((git, state_branch.into()));
        self
    }

    /// Evaluate time-based rules at a fixed instant instead of the wall clock.
    pub fn with_clock(mut self, now_epoch_secs: u64) -> Self {
        self.clock = Some(now_epoch_secs);
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn cache_path(&self) -> PathBuf {
        self.store.root.join(INDEX_FILE)
    }

    fn now(&self) -> u64 {
        self.clock.unwrap_or_else(time::now_epoch_secs)
    }

    fn require_store(&self) -> Result<(), GitgovError> {
        if self.store.exists() {
            Ok(())
        } else {
            Err(GitgovError::Uninitialized(format!(
                "no record store at {}",
                self.store.root.display()
            )))
        }
    }

    /// Stat-only digest of every record file: path, length, mtime.
    pub fn source_fingerprint(&self) -> Result<String, GitgovError> {
        let paths = self.store.record_paths()?;
        fingerprint_paths(&self.store, &paths)
    }

    pub fn is_index_up_to_date(&self) -> Result<bool, GitgovError> {
        let path = self.cache_path();
        if !path.exists() || !self.store.exists() {
            return Ok(false);
        }
        let head: CacheHead = match fs::read_to_string(&path)
            .map_err(GitgovError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(GitgovError::from))
        {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(error = %e, "index cache unreadable; treating as stale");
                return Ok(false);
            }
        };
        Ok(head.metadata.source_fingerprint == self.source_fingerprint()?)
    }

    /// Remove the cache artifact. Returns whether one existed.
    pub fn invalidate_cache(&self) -> Result<bool, GitgovError> {
        let path = self.cache_path();
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        tracing::debug!(path = %path.display(), "index cache invalidated");
        Ok(true)
    }

    /// The persisted snapshot, or `None` when absent or unreadable.
    pub fn get_index_data(&self) -> Result<Option<IndexSnapshot>, GitgovError> {
        let path = self.cache_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(error = %e, "index cache does not parse");
                Ok(None)
            }
        }
    }

    pub fn validate_integrity(&self) -> Result<IntegrityReport, GitgovError> {
        self.require_store()?;
        let paths = self.store.record_paths()?;
        let loaded = self.load(&paths)?;
        self.integrity_of(&loaded)
    }

    pub fn generate_index(&self) -> Result<IndexGenerationReport, GitgovError> {
        self.require_store()?;
        let started = Instant::now();

        // One listing drives both the fingerprint and the reads, so every
        // relationship is computed from the same point in time.
        let paths = self.store.record_paths()?;
        let fingerprint = fingerprint_paths(&self.store, &paths)?;
        let loaded = self.load(&paths)?;
        let read_time = started.elapsed().as_millis() as u64;

        let calc_started = Instant::now();
        let integrity = self.integrity_of(&loaded)?;
        let now = self.now();
        let mut snapshot = self.derive(&loaded, now);
        snapshot.metadata = IndexMetadata {
            generated_at: now,
            last_commit_hash: self.last_commit_hash(),
            source_fingerprint: fingerprint,
            integrity_status: integrity.status,
            record_counts: record_counts(&loaded),
            generation_time: started.elapsed().as_millis() as u64,
        };
        let calculation_time = calc_started.elapsed().as_millis() as u64;

        let mut errors: Vec<String> = loaded
            .failures
            .iter()
            .map(|(path, msg)| format!("{}: {}", path, msg))
            .collect();
        for record in &loaded.records {
            if let Err(msg) = &record.payload {
                errors.push(format!("{}: {}", record.rel_path, msg));
            }
        }

        let write_started = Instant::now();
        let (success, cache_size) = match self.write_snapshot(&snapshot) {
            Ok(size) => (true, size),
            Err(e) => {
                errors.push(format!("cache write failed: {}", e));
                (false, 0)
            }
        };
        let write_time = write_started.elapsed().as_millis() as u64;

        let report = IndexGenerationReport {
            success,
            records_processed: loaded.records.len() + loaded.failures.len(),
            metrics_calculated: snapshot.enriched_tasks.len(),
            generation_time: started.elapsed().as_millis() as u64,
            cache_size,
            errors,
            performance: PhaseTimings {
                read_time,
                calculation_time,
                write_time,
            },
            snapshot: Some(snapshot),
        };
        tracing::info!(
            records = report.records_processed,
            read_ms = read_time,
            calculate_ms = calculation_time,
            write_ms = write_time,
            integrity = integrity.status.as_str(),
            "index generated"
        );
        Ok(report)
    }

    fn write_snapshot(&self, snapshot: &IndexSnapshot) -> Result<u64, GitgovError> {
        let path = self.cache_path();
        store::write_envelope_file(&path, snapshot)?;
        Ok(fs::metadata(&path)?.len())
    }

    fn last_commit_hash(&self) -> Option<String> {
        let (git, branch) = self.git.as_ref()?;
        match git.rev_parse(branch) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::debug!(error = %e, "state branch tip unavailable");
                None
            }
        }
    }

    fn load(&self, paths: &[(RecordType, PathBuf)]) -> Result<LoadedStore, GitgovError> {
        let results: Vec<Result<LoadedRecord, (String, String)>> = paths
            .par_iter()
            .map(|(record_type, path)| {
                let rel_path = self.store.relative_path(path);
                match self.store.read_raw_path(*record_type, path) {
                    Ok(raw) => {
                        let payload =
                            AnyPayload::from_value(*record_type, raw.envelope.payload.clone())
                                .map_err(|e| format!("invalid {} payload: {}", record_type, e));
                        Ok(LoadedRecord {
                            raw,
                            rel_path,
                            payload,
                        })
                    }
                    Err(e) => Err((rel_path, e.to_string())),
                }
            })
            .collect();

        let mut loaded = LoadedStore::default();
        for (record_type, path) in paths {
            if let Some(stem) = path.file_stem() {
                loaded
                    .listed_ids
                    .entry(*record_type)
                    .or_default()
                    .insert(store::id_for_file_stem(*record_type, &stem.to_string_lossy()));
            }
        }
        for result in results {
            match result {
                Ok(record) => {
                    if let Ok(payload) = &record.payload {
                        loaded
                            .listed_ids
                            .entry(payload.record_type())
                            .or_default()
                            .insert(payload.id().to_string());
                    }
                    loaded.records.push(record);
                }
                Err(failure) => loaded.failures.push(failure),
            }
        }
        Ok(loaded)
    }

    fn integrity_of(&self, loaded: &LoadedStore) -> Result<IntegrityReport, GitgovError> {
        let identity = self.identity.as_ref();
        let checks: Vec<Result<integrity::EnvelopeCheck, GitgovError>> = loaded
            .records
            .par_iter()
            .map(|r| integrity::check_envelope(&r.raw.envelope, identity))
            .collect();

        let mut report = IntegrityReport {
            records_checked: loaded.records.len() + loaded.failures.len(),
            ..IntegrityReport::default()
        };
        for (path, msg) in &loaded.failures {
            report.schema_errors += 1;
            report.errors.push(IntegrityIssue {
                kind: IntegrityIssueKind::Schema,
                file_path: path.clone(),
                entity_id: None,
                message: format!("unreadable record: {}", msg),
            });
        }

        for (record, check) in loaded.records.iter().zip(checks) {
            let entity_id = record.raw.payload_id().map(str::to_string);
            let issue = |kind, message: String| IntegrityIssue {
                kind,
                file_path: record.rel_path.clone(),
                entity_id: entity_id.clone(),
                message,
            };

            // A signer whose actor record cannot be read fails this record only.
            let check = match check {
                Ok(check) => check,
                Err(e) => {
                    report.signature_failures += 1;
                    report.errors.push(issue(
                        IntegrityIssueKind::Actor,
                        format!("signers could not be resolved: {}", e),
                    ));
                    continue;
                }
            };

            if !check.checksum_ok {
                report.checksum_failures += 1;
                report.errors.push(issue(
                    IntegrityIssueKind::Checksum,
                    format!(
                        "payloadChecksum {} does not match recomputed {}",
                        record.raw.envelope.header.payload_checksum, check.recomputed_checksum
                    ),
                ));
            }
            if !check.signature_problems.is_empty() || !check.unknown_signers.is_empty() {
                report.signature_failures += 1;
                for p in &check.signature_problems {
                    report.errors.push(issue(IntegrityIssueKind::Signature, p.clone()));
                }
                for signer in &check.unknown_signers {
                    report.errors.push(issue(
                        IntegrityIssueKind::Signature,
                        format!("signer {} is not a known actor", signer),
                    ));
                }
            }
            for p in &check.historical_problems {
                report
                    .warnings
                    .push(issue(IntegrityIssueKind::Signature, p.clone()));
            }
            for signer in &check.revoked_signers {
                report.warnings.push(issue(
                    IntegrityIssueKind::Actor,
                    format!("signed by revoked actor {}", signer),
                ));
            }

            if record.raw.envelope.header.record_type != record.raw.record_type {
                report.schema_errors += 1;
                report.errors.push(issue(
                    IntegrityIssueKind::Schema,
                    format!(
                        "header recordType {} stored under {}/",
                        record.raw.envelope.header.record_type,
                        record.raw.record_type.dir_name()
                    ),
                ));
            }
            match &record.payload {
                Err(msg) => {
                    report.schema_errors += 1;
                    report.errors.push(issue(IntegrityIssueKind::Schema, msg.clone()));
                }
                Ok(payload) => {
                    for reference in payload.references() {
                        let known = loaded
                            .listed_ids
                            .get(&reference.target_type)
                            .is_some_and(|ids| ids.contains(&reference.target_id));
                        if !known {
                            report.reference_errors += 1;
                            report.warnings.push(issue(
                                IntegrityIssueKind::Reference,
                                format!(
                                    "{} references missing {} {}",
                                    reference.field, reference.target_type, reference.target_id
                                ),
                            ));
                        }
                    }
                }
            }
        }

        let by_location = |a: &IntegrityIssue, b: &IntegrityIssue| {
            a.file_path.cmp(&b.file_path).then(a.message.cmp(&b.message))
        };
        report.errors.sort_by(by_location);
        report.warnings.sort_by(by_location);
        report.status = if !report.errors.is_empty() {
            IntegrityStatus::Errors
        } else if !report.warnings.is_empty() {
            IntegrityStatus::Warnings
        } else {
            IntegrityStatus::Valid
        };
        if report.checksum_failures + report.signature_failures > 0 {
            report.remediation = GitgovError::IntegrityViolation(String::new())
                .remediation()
                .map(str::to_string);
        }
        Ok(report)
    }

    fn derive(&self, loaded: &LoadedStore, now: u64) -> IndexSnapshot {
        let mut tasks: Vec<(&RawRecord, &TaskRecord)> = Vec::new();
        let mut cycles: Vec<&CycleRecord> = Vec::new();
        let mut feedback: Vec<(&RawRecord, &FeedbackRecord)> = Vec::new();
        let mut actors: Vec<&ActorRecord> = Vec::new();
        let mut executions_by_task: FxHashMap<&str, Vec<u64>> = FxHashMap::default();
        let mut changelogs_by_task: FxHashMap<&str, Vec<u64>> = FxHashMap::default();
        let mut total_executions = 0;
        let mut total_changelogs = 0;

        for record in &loaded.records {
            let Ok(payload) = &record.payload else {
                continue;
            };
            let created = record.raw.envelope.created_at().unwrap_or(0);
            match payload {
                AnyPayload::Task(t) => tasks.push((&record.raw, t)),
                AnyPayload::Cycle(c) => cycles.push(c),
                AnyPayload::Feedback(f) => feedback.push((&record.raw, f)),
                AnyPayload::Actor(a) => actors.push(a),
                AnyPayload::Execution(e) => {
                    total_executions += 1;
                    executions_by_task.entry(&e.task_id).or_default().push(created);
                }
                AnyPayload::Changelog(c) => {
                    total_changelogs += 1;
                    if c.entity_type == RecordType::Task {
                        changelogs_by_task.entry(&c.entity_id).or_default().push(created);
                    }
                }
                AnyPayload::Agent(_) => {}
            }
        }
        tasks.sort_by(|a, b| a.1.id.cmp(&b.1.id));
        cycles.sort_by(|a, b| a.id.cmp(&b.id));
        feedback.sort_by(|a, b| a.1.id.cmp(&b.1.id));
        actors.sort_by(|a, b| a.id.cmp(&b.id));

        let mut feedback_by_task: FxHashMap<&str, Vec<(u64, &FeedbackRecord)>> = FxHashMap::default();
        for (raw, f) in &feedback {
            if f.entity_type == RecordType::Task {
                feedback_by_task
                    .entry(&f.entity_id)
                    .or_default()
                    .push((raw.envelope.created_at().unwrap_or(0), f));
            }
        }
        let mut cycles_by_task: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        for c in &cycles {
            for task_id in &c.task_ids {
                cycles_by_task.entry(task_id).or_default().push(&c.id);
            }
        }

        let empty_ts: Vec<u64> = Vec::new();
        let empty_fb: Vec<(u64, &FeedbackRecord)> = Vec::new();
        let enriched_tasks: Vec<EnrichedTask> = tasks
            .iter()
            .map(|(raw, task)| {
                let id = task.id.as_str();
                let mut cycle_ids: Vec<String> = task.cycle_ids.clone();
                cycle_ids.extend(
                    cycles_by_task
                        .get(id)
                        .into_iter()
                        .flatten()
                        .map(|c| c.to_string()),
                );
                cycle_ids.sort();
                cycle_ids.dedup();
                self.enrich(
                    raw,
                    task,
                    TaskLinks {
                        executions: executions_by_task.get(id).unwrap_or(&empty_ts),
                        changelogs: changelogs_by_task.get(id).unwrap_or(&empty_ts),
                        feedback: feedback_by_task.get(id).unwrap_or(&empty_fb),
                        cycles: cycle_ids,
                    },
                    now,
                )
            })
            .collect();

        let mut derived_states = DerivedStates::default();
        for t in &enriched_tasks {
            let state = &t.derived_state;
            if state.is_stalled {
                derived_states.stalled_tasks.push(t.task.id.clone());
            }
            if state.is_at_risk {
                derived_states.at_risk_tasks.push(t.task.id.clone());
            }
            if state.needs_clarification {
                derived_states.needs_clarification_tasks.push(t.task.id.clone());
            }
            if state.is_blocked_by_dependency {
                derived_states.blocked_by_dependency_tasks.push(t.task.id.clone());
            }
        }

        let mut metrics = IndexMetrics {
            total_tasks: tasks.len(),
            total_executions,
            total_changelogs,
            ..IndexMetrics::default()
        };
        for status in TaskStatus::ALL {
            metrics.tasks_by_status.insert(status.as_str().to_string(), 0);
        }
        for (_, t) in &tasks {
            *metrics
                .tasks_by_status
                .entry(t.status.as_str().to_string())
                .or_default() += 1;
            *metrics
                .tasks_by_priority
                .entry(t.priority.as_str().to_string())
                .or_default() += 1;
        }
        for priority in [
            TaskPriority::Low,
            TaskPriority::Medium,
            TaskPriority::High,
            TaskPriority::Critical,
        ] {
            metrics
                .tasks_by_priority
                .entry(priority.as_str().to_string())
                .or_default();
        }
        for c in &cycles {
            *metrics
                .cycles_by_status
                .entry(c.status.as_str().to_string())
                .or_default() += 1;
        }
        for (_, f) in &feedback {
            if f.is_open() {
                metrics.open_feedback += 1;
            } else {
                metrics.resolved_feedback += 1;
            }
        }
        if !enriched_tasks.is_empty() {
            let total: u64 = enriched_tasks
                .iter()
                .map(|t| t.derived_state.health_score as u64)
                .sum();
            let avg = total as f64 / enriched_tasks.len() as f64;
            metrics.average_health_score = (avg * 10.0).round() / 10.0;
        }

        IndexSnapshot {
            metadata: IndexMetadata::default(),
            tasks: tasks.iter().map(|(_, t)| (*t).clone()).collect(),
            enriched_tasks,
            cycles: cycles.into_iter().cloned().collect(),
            actors: actors.into_iter().cloned().collect(),
            feedback: feedback.into_iter().map(|(_, f)| f.clone()).collect(),
            derived_states,
            activity_history: self.activity_history(loaded),
            metrics,
        }
    }

    fn enrich(&self, raw: &RawRecord, task: &TaskRecord, links: TaskLinks<'_>, now: u64) -> EnrichedTask {
        let own = raw.envelope.last_signed_at().unwrap_or(0);
        let mut last_updated = own;
        let mut last_activity_type = if raw.envelope.header.signatures.len() > 1 {
            ActivityType::TaskModified
        } else {
            ActivityType::TaskCreated
        };
        for &ts in links.executions {
            if ts > last_updated {
                last_updated = ts;
                last_activity_type = ActivityType::ExecutionAdded;
            }
        }
        for &ts in links.changelogs {
            if ts > last_updated {
                last_updated = ts;
                last_activity_type = ActivityType::ChangelogAdded;
            }
        }

        let mut blocked_by: Vec<String> = links
            .feedback
            .iter()
            .filter(|(_, f)| f.is_open() && f.feedback_type == FeedbackType::Blocking)
            .map(|(_, f)| f.id.clone())
            .collect();
        blocked_by.sort();
        let open_question_count = links
            .feedback
            .iter()
            .filter(|(_, f)| f.is_open() && f.feedback_type == FeedbackType::Question)
            .count();
        let assigned_to = links
            .feedback
            .iter()
            .filter(|(_, f)| {
                !f.is_open() && f.feedback_type == FeedbackType::Assignment && f.assignee.is_some()
            })
            .max_by(|a, b| a.0.cmp(&b.0).then(a.1.id.cmp(&b.1.id)))
            .and_then(|(_, f)| f.assignee.clone());

        let terminal = task.status.is_terminal();
        let is_stalled = task.status.is_active_like()
            && time::days_between(last_updated, now) > self.config.staleness_window_days as f64;
        let health_score = if terminal {
            100
        } else {
            score_health(HealthInputs {
                stalled: is_stalled,
                open_blocking: blocked_by.len(),
                open_questions: open_question_count,
                active_without_executions: task.status == TaskStatus::Active
                    && links.executions.is_empty(),
            })
        };
        let time_in_current_stage = (time::days_between(own, now) * 100.0).round() / 100.0;
        let mut depends_on: Vec<String> = task.dependencies().map(str::to_string).collect();
        depends_on.sort();
        depends_on.dedup();

        EnrichedTask {
            task: task.clone(),
            derived_state: DerivedState {
                is_stalled,
                is_at_risk: !terminal && health_score < self.config.at_risk_threshold,
                needs_clarification: open_question_count > 0,
                is_blocked_by_dependency: !blocked_by.is_empty(),
                health_score,
                time_in_current_stage,
            },
            metrics: TaskMetrics {
                execution_count: links.executions.len(),
                blocking_feedback_count: blocked_by.len(),
                open_question_count,
            },
            relationships: TaskRelationships {
                assigned_to,
                depends_on,
                blocked_by,
                cycles: links.cycles,
            },
            last_updated,
            last_activity_type,
        }
    }

    fn activity_history(&self, loaded: &LoadedStore) -> Vec<ActivityEvent> {
        let mut events: Vec<ActivityEvent> = loaded
            .records
            .iter()
            .filter_map(|r| {
                let payload = r.payload.as_ref().ok()?;
                let first = r.raw.envelope.header.signatures.first();
                Some(ActivityEvent {
                    timestamp: r.raw.envelope.created_at()?,
                    activity_type: ActivityType::for_creation(payload.record_type()),
                    entity_type: payload.record_type(),
                    entity_id: payload.id().to_string(),
                    title: output::one_line(payload.label(), 120),
                    actor_id: first.map(|s| s.key_id.clone()),
                })
            })
            .collect();
        events.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(a.entity_id.cmp(&b.entity_id))
        });
        events.truncate(self.config.activity_history_limit);
        events
    }
}

struct TaskLinks<'a> {
    executions: &'a [u64],
    changelogs: &'a [u64],
    feedback: &'a [(u64, &'a FeedbackRecord)],
    cycles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    pub stalled: bool,
    pub open_blocking: usize,
    pub open_questions: usize,
    pub active_without_executions: bool,
}

/// 100 minus capped penalties, clamped to 0..=100.
pub fn score_health(inputs: HealthInputs) -> u32 {
    let mut score: i64 = 100;
    if inputs.stalled {
        score -= STALLED_PENALTY;
    }
    score -= (inputs.open_blocking as i64 * BLOCKING_PENALTY).min(BLOCKING_PENALTY_CAP);
    score -= (inputs.open_questions as i64 * QUESTION_PENALTY).min(QUESTION_PENALTY_CAP);
    if inputs.active_without_executions {
        score -= IDLE_ACTIVE_PENALTY;
    }
    score.clamp(0, 100) as u32
}

fn record_counts(loaded: &LoadedStore) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = RecordType::ALL
        .iter()
        .map(|t| (t.as_str().to_string(), 0))
        .collect();
    for record in &loaded.records {
        if let Ok(payload) = &record.payload {
            *counts
                .entry(payload.record_type().as_str().to_string())
                .or_default() += 1;
        }
    }
    counts
}

fn fingerprint_paths(
    store: &RecordStore,
    paths: &[(RecordType, PathBuf)],
) -> Result<String, GitgovError> {
    let mut lines = Vec::with_capacity(paths.len());
    for (_, path) in paths {
        lines.extend(stat_line(store, path)?);
    }
    lines.sort();
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// `None` when the file vanished after listing; the fingerprint then differs
/// from any cache that still counted it.
fn stat_line(store: &RecordStore, path: &Path) -> Result<Option<String>, GitgovError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(Some(format!(
        "{}|{}|{}",
        store.relative_path(path),
        meta.len(),
        mtime
    )))
}

#[derive(Parser, Debug)]
#[clap(name = "indexer", about = "Generate or validate the index cache")]
pub struct IndexerCli {
    /// Only re-verify checksums and signatures; do not touch the cache.
    #[clap(long)]
    pub validate_only: bool,
    /// Regenerate even when the cache is up to date.
    #[clap(long)]
    pub force: bool,
    #[clap(long)]
    pub json: bool,
}

pub fn run_indexer_cli(
    engine: &IndexerEngine,
    cli: IndexerCli,
    quiet: bool,
) -> Result<i32, GitgovError> {
    if cli.validate_only {
        let report = engine.validate_integrity()?;
        let code = if report.status == IntegrityStatus::Errors { 1 } else { 0 };
        if cli.json {
            let body = output::json_document(
                "indexer.validate",
                code == 0,
                serde_json::json!({ "report": report }),
            );
            println!("{}", serde_json::to_string_pretty(&body)?);
        } else if !quiet {
            println!(
                "integrity: {} ({} records, {} checksum failures, {} signature failures)",
                output::badge(report.status.as_str()),
                report.records_checked,
                report.checksum_failures,
                report.signature_failures
            );
            for issue in report.errors.iter().chain(&report.warnings) {
                println!(
                    "  {} {}",
                    issue.file_path,
                    output::one_line(&issue.message, output::MESSAGE_WIDTH)
                );
            }
            if let Some(hint) = &report.remediation {
                println!("hint: {}", hint);
            }
        }
        return Ok(code);
    }

    if !cli.force && engine.is_index_up_to_date()? {
        if cli.json {
            let body = output::json_document(
                "indexer",
                true,
                serde_json::json!({ "upToDate": true }),
            );
            println!("{}", serde_json::to_string_pretty(&body)?);
        } else if !quiet {
            println!("index cache is up to date");
        }
        return Ok(0);
    }

    let report = engine.generate_index()?;
    let code = if report.success { 0 } else { 1 };
    if cli.json {
        let body = output::json_document("indexer", report.success, serde_json::json!({ "report": report }));
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else if !quiet {
        let integrity = report
            .snapshot
            .as_ref()
            .map(|s| s.metadata.integrity_status)
            .unwrap_or_default();
        println!(
            "indexed {} records in {}ms (cache {} bytes, integrity {})",
            report.records_processed,
            report.generation_time,
            report.cache_size,
            output::badge(integrity.as_str())
        );
        if !report.errors.is_empty() {
            println!("{}", output::indented_list(&report.errors, 5));
        }
    }
    Ok(code)
}
