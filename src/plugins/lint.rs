//! Lint and auto-fix engine.
//!
//! Each `LintValidator` is an independent check over one record file. A bad
//! record never aborts the scan; it becomes a result. `fix` repairs only
//! results marked fixable, backs every touched file up first (once per run),
//! and re-signs repaired payloads with the current actor's key.
//!
//! The engine never touches the index cache. Callers regenerate it after a
//! fix run that changed at least one record.

use crate::core::config;
use crate::core::crypto::{self, Signer};
use crate::core::error::GitgovError;
use crate::core::identity::{self, FsKeyProvider, IdentityResolver, KeyProvider, StoreIdentityResolver};
use crate::core::integrity;
use crate::core::output;
use crate::core::schemas::{
    AnyPayload, CURRENT_SCHEMA_VERSION, CycleRecord, LEGACY_SCHEMA_VERSIONS, RecordEnvelope,
    RecordType, TaskRecord,
};
use crate::core::store::{self, RecordStore};
use crate::core::time;
use crate::plugins::indexer::IndexerEngine;
use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub const BACKUPS_DIR: &str = ".backups";
/// Signature role appended by repairs.
pub const REPAIR_ROLE: &str = "repair";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LintValidator {
    SchemaValidation,
    ChecksumVerification,
    SignatureStructure,
    ReferentialIntegrity,
    BidirectionalConsistency,
    FileNaming,
    ActorResolution,
    SchemaVersionMismatch,
}

impl LintValidator {
    pub const ALL: [LintValidator; 8] = [
        LintValidator::SchemaValidation,
        LintValidator::ChecksumVerification,
        LintValidator::SignatureStructure,
        LintValidator::ReferentialIntegrity,
        LintValidator::BidirectionalConsistency,
        LintValidator::FileNaming,
        LintValidator::ActorResolution,
        LintValidator::SchemaVersionMismatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LintValidator::SchemaValidation => "SCHEMA_VALIDATION",
            LintValidator::ChecksumVerification => "CHECKSUM_VERIFICATION",
            LintValidator::SignatureStructure => "SIGNATURE_STRUCTURE",
            LintValidator::ReferentialIntegrity => "REFERENTIAL_INTEGRITY",
            LintValidator::BidirectionalConsistency => "BIDIRECTIONAL_CONSISTENCY",
            LintValidator::FileNaming => "FILE_NAMING",
            LintValidator::ActorResolution => "ACTOR_RESOLUTION",
            LintValidator::SchemaVersionMismatch => "SCHEMA_VERSION_MISMATCH",
        }
    }

    /// Accepts `SIGNATURE_STRUCTURE`, `signature-structure`, and similar.
    pub fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL.into_iter().find(|v| v.as_str() == wanted)
    }

    /// Repairs that change payload or signatures end with a new signature.
    pub fn fix_needs_signature(self) -> bool {
        matches!(
            self,
            LintValidator::SchemaValidation
                | LintValidator::ChecksumVerification
                | LintValidator::SignatureStructure
                | LintValidator::BidirectionalConsistency
        )
    }

    fn fix_order(self) -> u8 {
        match self {
            LintValidator::SchemaVersionMismatch => 0,
            LintValidator::SchemaValidation => 1,
            LintValidator::BidirectionalConsistency => 2,
            LintValidator::ChecksumVerification => 3,
            LintValidator::SignatureStructure => 4,
            LintValidator::FileNaming => 5,
            LintValidator::ReferentialIntegrity | LintValidator::ActorResolution => 6,
        }
    }

    fn manual_remediation(self) -> &'static str {
        match self {
            LintValidator::ReferentialIntegrity => {
                "point the reference at an existing record or remove it"
            }
            LintValidator::ActorResolution => "register the signing actor or re-sign as a known actor",
            LintValidator::SchemaValidation => "edit the record so it matches its schema",
            LintValidator::SchemaVersionMismatch => "no migration is defined for this schema version",
            _ => "repair the record by hand",
        }
    }
}

impl std::fmt::Display for LintValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_validator(s: &str) -> Result<LintValidator, String> {
    LintValidator::parse(s).ok_or_else(|| {
        let names: Vec<&str> = LintValidator::ALL.iter().map(|v| v.as_str()).collect();
        format!("unknown validator '{}' (expected one of {})", s, names.join(", "))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LintLevel {
    Error,
    Warning,
}

impl LintLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LintLevel::Error => "error",
            LintLevel::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintEntity {
    #[serde(rename = "type")]
    pub entity_type: RecordType,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintResult {
    pub level: LintLevel,
    /// Relative to the store root, e.g. `tasks/<id>.json`.
    pub file_path: String,
    pub validator: LintValidator,
    pub message: String,
    pub entity: Option<LintEntity>,
    pub fixable: bool,
    /// Id the repair needs, e.g. the task missing from a cycle's `taskIds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintSummary {
    pub files_checked: usize,
    pub errors: usize,
    pub warnings: usize,
    pub fixable: usize,
    pub execution_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintReport {
    pub summary: LintSummary,
    pub results: Vec<LintResult>,
    /// `max_errors` cut error-level results; the summary still counts them.
    pub truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LintOptions {
    /// Run only these validators; `None` runs all of them.
    pub validators: Option<Vec<LintValidator>>,
    pub max_errors: Option<usize>,
}

impl LintOptions {
    fn enabled(&self, validator: LintValidator) -> bool {
        self.validators
            .as_ref()
            .is_none_or(|only| only.contains(&validator))
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixOptions {
    /// Attempt only these validators' results; `None` attempts every result.
    pub fix_types: Option<Vec<LintValidator>>,
    /// Plan the repairs without writing files or backups.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    pub file_path: String,
    pub validator: LintValidator,
    pub success: bool,
    pub action: String,
    pub backup_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSummary {
    pub fixed: usize,
    pub failed: usize,
    pub backups_created: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixReport {
    pub summary: FixSummary,
    pub fixes: Vec<FixAttempt>,
}

/// Whole-store facts the per-file validators need.
#[derive(Default)]
struct LintContext {
    known_ids: FxHashMap<RecordType, FxHashSet<String>>,
    /// cycle id -> tasks whose `cycleIds` name it.
    tasks_claiming_cycle: FxHashMap<String, Vec<String>>,
    /// task id -> cycles whose `taskIds` list it.
    cycles_listing_task: FxHashMap<String, Vec<String>>,
}

impl LintContext {
    fn knows(&self, record_type: RecordType, id: &str) -> bool {
        self.known_ids
            .get(&record_type)
            .is_some_and(|ids| ids.contains(id))
    }

    fn link_tasks(&mut self, tasks: &[TaskRecord], cycles: &[CycleRecord]) {
        for task in tasks {
            for cycle_id in &task.cycle_ids {
                self.tasks_claiming_cycle
                    .entry(cycle_id.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }
        for cycle in cycles {
            for task_id in &cycle.task_ids {
                self.cycles_listing_task
                    .entry(task_id.clone())
                    .or_default()
                    .push(cycle.id.clone());
            }
        }
    }
}

pub struct LintEngine {
    store: RecordStore,
    identity: Arc<dyn IdentityResolver>,
    keys: Arc<dyn KeyProvider>,
    cache: Option<Arc<IndexerEngine>>,
}

impl LintEngine {
    pub fn new(
        store: RecordStore,
        identity: Arc<dyn IdentityResolver>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            store,
            identity,
            keys,
            cache: None,
        }
    }

    /// Engine with store-backed identity, file keys, and the project cache.
    pub fn for_store(store: RecordStore) -> Result<Self, GitgovError> {
        let cfg = config::load_config(&store.root)?;
        let identity = Arc::new(StoreIdentityResolver::from_config(store.clone(), &cfg));
        let keys = Arc::new(FsKeyProvider::new(&store));
        let indexer = Arc::new(IndexerEngine::for_store(store.clone())?);
        Ok(Self::new(store, identity, keys).with_cache(indexer))
    }

    /// Resolve references through the index cache when it is fresh.
    pub fn with_cache(mut self, indexer: Arc<IndexerEngine>) -> Self {
        self.cache = Some(indexer);
        self
    }

    pub fn lint(&self, options: &LintOptions) -> Result<LintReport, GitgovError> {
        self.require_store()?;
        let started = Instant::now();
        let ctx = self.build_context()?;
        let paths = self.store.record_paths()?;
        let results: Vec<LintResult> = paths
            .par_iter()
            .flat_map_iter(|(record_type, path)| self.lint_path(*record_type, path, &ctx, options))
            .collect();
        let report = finish_report(paths.len(), results, options, started);
        tracing::info!(
            files = report.summary.files_checked,
            errors = report.summary.errors,
            warnings = report.summary.warnings,
            fixable = report.summary.fixable,
            "lint finished"
        );
        Ok(report)
    }

    /// Lint one record file. The path must sit in a record-type directory.
    pub fn lint_file(&self, path: &Path, options: &LintOptions) -> Result<LintReport, GitgovError> {
        self.require_store()?;
        let started = Instant::now();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        if !path.is_file() {
            return Err(GitgovError::NotFound(path.display().to_string()));
        }
        let record_type = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|d| RecordType::from_dir_name(&d.to_string_lossy()))
            .ok_or_else(|| {
                GitgovError::PathError(format!(
                    "{} is not inside a record directory",
                    path.display()
                ))
            })?;
        let ctx = self.build_context()?;
        let results = self.lint_path(record_type, &path, &ctx, options);
        Ok(finish_report(1, results, options, started))
    }

    /// Legacy-format records only, for review before a bulk migration.
    pub fn detect_migrations(&self) -> Result<LintReport, GitgovError> {
        self.lint(&LintOptions {
            validators: Some(vec![LintValidator::SchemaVersionMismatch]),
            max_errors: None,
        })
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

    fn build_context(&self) -> Result<LintContext, GitgovError> {
        let mut ctx = LintContext::default();
        for record_type in RecordType::ALL {
            let ids: FxHashSet<String> = self.store.list_ids(record_type)?.into_iter().collect();
            ctx.known_ids.insert(record_type, ids);
        }

        let fresh = match &self.cache {
            Some(indexer) if indexer.is_index_up_to_date()? => indexer.get_index_data()?,
            _ => None,
        };
        if let Some(snapshot) = fresh {
            tracing::debug!("lint resolving references through the index cache");
            let cached: [(RecordType, Vec<String>); 4] = [
                (RecordType::Task, snapshot.tasks.iter().map(|t| t.id.clone()).collect()),
                (RecordType::Cycle, snapshot.cycles.iter().map(|c| c.id.clone()).collect()),
                (RecordType::Actor, snapshot.actors.iter().map(|a| a.id.clone()).collect()),
                (
                    RecordType::Feedback,
                    snapshot.feedback.iter().map(|f| f.id.clone()).collect(),
                ),
            ];
            for (record_type, ids) in cached {
                ctx.known_ids.entry(record_type).or_default().extend(ids);
            }
            ctx.link_tasks(&snapshot.tasks, &snapshot.cycles);
            return Ok(ctx);
        }

        let tasks: Vec<TaskRecord> = self.read_tolerant(RecordType::Task)?;
        let cycles: Vec<CycleRecord> = self.read_tolerant(RecordType::Cycle)?;
        for t in &tasks {
            ctx.known_ids.entry(RecordType::Task).or_default().insert(t.id.clone());
        }
        for c in &cycles {
            ctx.known_ids.entry(RecordType::Cycle).or_default().insert(c.id.clone());
        }
        ctx.link_tasks(&tasks, &cycles);
        Ok(ctx)
    }

    /// Payloads of one type that parse; the rest are reported by the validators.
    fn read_tolerant<P: serde::de::DeserializeOwned>(
        &self,
        record_type: RecordType,
    ) -> Result<Vec<P>, GitgovError> {
        let mut out = Vec::new();
        for path in self.store.list_type_paths(record_type)? {
            let Ok(raw) = self.store.read_raw_path(record_type, &path) else {
                continue;
            };
            if let Ok(payload) = serde_json::from_value(raw.envelope.payload) {
                out.push(payload);
            }
        }
        Ok(out)
    }

    fn lint_path(
        &self,
        record_type: RecordType,
        path: &Path,
        ctx: &LintContext,
        options: &LintOptions,
    ) -> Vec<LintResult> {
        let rel = self.store.relative_path(path);
        let mut out = Vec::new();

        let raw = match self.store.read_raw_path(record_type, path) {
            Ok(raw) => raw,
            Err(e) => {
                if options.enabled(LintValidator::SchemaValidation) {
                    out.push(LintResult {
                        level: LintLevel::Error,
                        file_path: rel,
                        validator: LintValidator::SchemaValidation,
                        message: format!("not a record envelope: {}", e),
                        entity: None,
                        fixable: false,
                        target: None,
                    });
                }
                return out;
            }
        };
        let envelope = &raw.envelope;
        let entity = raw.payload_id().map(|id| LintEntity {
            entity_type: record_type,
            id: id.to_string(),
        });
        let result = |level, validator, message: String, fixable: bool| LintResult {
            level,
            file_path: rel.clone(),
            validator,
            message,
            entity: entity.clone(),
            fixable,
            target: None,
        };
        let parsed = AnyPayload::from_value(record_type, envelope.payload.clone());

        if options.enabled(LintValidator::SchemaValidation) {
            if envelope.header.record_type != record_type {
                out.push(result(
                    LintLevel::Error,
                    LintValidator::SchemaValidation,
                    format!(
                        "header recordType {} does not match directory {}/",
                        envelope.header.record_type,
                        record_type.dir_name()
                    ),
                    false,
                ));
            }
            match &parsed {
                Err(e) => out.push(result(
                    LintLevel::Error,
                    LintValidator::SchemaValidation,
                    format!("payload does not match the {} schema: {}", record_type, e),
                    false,
                )),
                Ok(payload) => {
                    if !store::is_valid_id(record_type, payload.id()) {
                        out.push(result(
                            LintLevel::Error,
                            LintValidator::SchemaValidation,
                            format!("malformed {} id {}", record_type, payload.id()),
                            false,
                        ));
                    }
                    let missing = missing_default_fields(&envelope.payload, payload);
                    if !missing.is_empty() {
                        out.push(result(
                            LintLevel::Error,
                            LintValidator::SchemaValidation,
                            format!("missing fields with defaults: {}", missing.join(", ")),
                            true,
                        ));
                    }
                }
            }
        }

        let wants_integrity = options.enabled(LintValidator::ChecksumVerification)
            || options.enabled(LintValidator::SignatureStructure)
            || options.enabled(LintValidator::ActorResolution);
        if wants_integrity {
            match integrity::check_envelope(envelope, self.identity.as_ref()) {
                Ok(check) => {
                    if options.enabled(LintValidator::ChecksumVerification) && !check.checksum_ok {
                        out.push(result(
                            LintLevel::Error,
                            LintValidator::ChecksumVerification,
                            format!(
                                "payloadChecksum {} does not match recomputed {}",
                                envelope.header.payload_checksum, check.recomputed_checksum
                            ),
                            true,
                        ));
                    }
                    if options.enabled(LintValidator::SignatureStructure)
                        && !check.signature_problems.is_empty()
                    {
                        out.push(result(
                            LintLevel::Error,
                            LintValidator::SignatureStructure,
                            check.signature_problems.join("; "),
                            true,
                        ));
                    }
                    if options.enabled(LintValidator::SignatureStructure)
                        && !check.historical_problems.is_empty()
                    {
                        out.push(result(
                            LintLevel::Warning,
                            LintValidator::SignatureStructure,
                            format!(
                                "superseded signatures kept for audit: {}",
                                check.historical_problems.join("; ")
                            ),
                            false,
                        ));
                    }
                    if options.enabled(LintValidator::ActorResolution) {
                        for signer in &check.unknown_signers {
                            out.push(result(
                                LintLevel::Error,
                                LintValidator::ActorResolution,
                                format!("signer {} is not a registered actor", signer),
                                false,
                            ));
                        }
                        for signer in &check.revoked_signers {
                            out.push(result(
                                LintLevel::Warning,
                                LintValidator::ActorResolution,
                                format!("signed by revoked actor {}", signer),
                                false,
                            ));
                        }
                    }
                }
                Err(e) => out.push(result(
                    LintLevel::Error,
                    LintValidator::ActorResolution,
                    format!("could not resolve signers: {}", e),
                    false,
                )),
            }
        }

        if let Ok(payload) = &parsed {
            if options.enabled(LintValidator::ReferentialIntegrity) {
                for reference in payload.references() {
                    if !ctx.knows(reference.target_type, &reference.target_id) {
                        out.push(result(
                            LintLevel::Warning,
                            LintValidator::ReferentialIntegrity,
                            format!(
                                "{} references missing {} {}",
                                reference.field, reference.target_type, reference.target_id
                            ),
                            false,
                        ));
                    }
                }
            }
            if options.enabled(LintValidator::BidirectionalConsistency) {
                for (message, target) in missing_back_links(payload, ctx) {
                    let mut r = result(
                        LintLevel::Warning,
                        LintValidator::BidirectionalConsistency,
                        message,
                        true,
                    );
                    r.target = Some(target);
                    out.push(r);
                }
            }
            if options.enabled(LintValidator::FileNaming) {
                let expected = store::file_stem_for_id(payload.id());
                let actual = path.file_stem().map(|s| s.to_string_lossy().to_string());
                if actual.as_deref() != Some(expected.as_str()) {
                    out.push(result(
                        LintLevel::Error,
                        LintValidator::FileNaming,
                        format!(
                            "file name does not encode id {} (expected {}.{})",
                            payload.id(),
                            expected,
                            store::RECORD_EXT
                        ),
                        true,
                    ));
                }
            }
        }

        if options.enabled(LintValidator::SchemaVersionMismatch)
            && envelope.header.schema_version != CURRENT_SCHEMA_VERSION
        {
            let legacy = LEGACY_SCHEMA_VERSIONS.contains(&envelope.header.schema_version.as_str());
            out.push(result(
                LintLevel::Warning,
                LintValidator::SchemaVersionMismatch,
                format!(
                    "schemaVersion {} (current {}){}",
                    envelope.header.schema_version,
                    CURRENT_SCHEMA_VERSION,
                    if legacy { "" } else { "; no migration defined" }
                ),
                legacy,
            ));
        }
        out
    }

    fn repair_signer(&self) -> Result<Signer, GitgovError> {
        let actor = self.identity.get_current_actor()?;
        identity::signer_for(self.keys.as_ref(), &actor.id)
    }

    pub fn fix(&self, report: &LintReport, options: &FixOptions) -> Result<FixReport, GitgovError> {
        self.require_store()?;
        let in_scope = |v: LintValidator| {
            options
                .fix_types
                .as_ref()
                .is_none_or(|only| only.contains(&v))
        };

        let mut fixes = Vec::new();
        let mut by_file: BTreeMap<&str, Vec<&LintResult>> = BTreeMap::new();
        for r in report.results.iter().filter(|r| in_scope(r.validator)) {
            if r.fixable {
                by_file.entry(r.file_path.as_str()).or_default().push(r);
            } else {
                fixes.push(FixAttempt {
                    file_path: r.file_path.clone(),
                    validator: r.validator,
                    success: false,
                    action: "skipped".to_string(),
                    backup_path: None,
                    error: Some(format!(
                        "not auto-fixable: {}",
                        r.validator.manual_remediation()
                    )),
                });
            }
        }

        let needs_signer = by_file
            .values()
            .flatten()
            .any(|r| r.validator.fix_needs_signature());
        let signer = if needs_signer {
            Some(self.repair_signer().map_err(|e| e.to_string()))
        } else {
            None
        };

        let mut run = FixRun {
            backup_root: self
                .store
                .root
                .join(BACKUPS_DIR)
                .join(time::new_run_id()),
            dry_run: options.dry_run,
            backups_created: 0,
        };
        for (file, results) in by_file {
            fixes.extend(self.fix_file(file, results, signer.as_ref(), &mut run));
        }

        for attempt in &fixes {
            if attempt.success {
                tracing::info!(file = %attempt.file_path, validator = %attempt.validator, action = %attempt.action, "fixed");
            } else {
                tracing::warn!(
                    file = %attempt.file_path,
                    validator = %attempt.validator,
                    error = attempt.error.as_deref().unwrap_or(""),
                    "fix failed"
                );
            }
        }
        let fixed = fixes.iter().filter(|f| f.success).count();
        Ok(FixReport {
            summary: FixSummary {
                fixed,
                failed: fixes.len() - fixed,
                backups_created: run.backups_created,
            },
            fixes,
        })
    }

    fn fix_file(
        &self,
        rel: &str,
        mut results: Vec<&LintResult>,
        signer: Option<&Result<Signer, String>>,
        run: &mut FixRun,
    ) -> Vec<FixAttempt> {
        results.sort_by_key(|r| r.validator.fix_order());
        let attempt = |r: &LintResult, success: bool, action: String, error: Option<String>| FixAttempt {
            file_path: rel.to_string(),
            validator: r.validator,
            success,
            action,
            backup_path: None,
            error,
        };
        let fail_all = |results: &[&LintResult], error: String| -> Vec<FixAttempt> {
            results
                .iter()
                .map(|&r| attempt(r, false, "skipped".to_string(), Some(error.clone())))
                .collect()
        };

        let path = self.store.root.join(rel);
        let Some(record_type) = Path::new(rel)
            .components()
            .next()
            .and_then(|c| RecordType::from_dir_name(&c.as_os_str().to_string_lossy()))
        else {
            return fail_all(&results, format!("{} is not inside a record directory", rel));
        };
        let mut envelope: RecordEnvelope<JsonValue> =
            match self.store.read_raw_path(record_type, &path) {
                Ok(raw) => raw.envelope,
                Err(e) => return fail_all(&results, e.to_string()),
            };

        let mut done: Vec<FixAttempt> = Vec::new();
        let mut planned: Vec<(&LintResult, String)> = Vec::new();
        let mut changed = false;
        let mut resign = false;
        let mut rename_to: Option<PathBuf> = None;

        for r in results {
            if r.validator.fix_needs_signature() {
                match signer {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        done.push(attempt(r, false, "skipped".to_string(), Some(e.clone())));
                        continue;
                    }
                    None => {
                        done.push(attempt(r, false, "skipped".to_string(), Some("no signer".to_string())));
                        continue;
                    }
                }
            }
            match r.validator {
                LintValidator::SchemaVersionMismatch => {
                    let from = envelope.header.schema_version.clone();
                    if LEGACY_SCHEMA_VERSIONS.contains(&from.as_str()) {
                        envelope.header.schema_version = CURRENT_SCHEMA_VERSION.to_string();
                        changed = true;
                        planned.push((
                            r,
                            format!("migrated schemaVersion {} -> {}", from, CURRENT_SCHEMA_VERSION),
                        ));
                    } else {
                        done.push(attempt(
                            r,
                            false,
                            "skipped".to_string(),
                            Some(format!("no migration from schemaVersion {}", from)),
                        ));
                    }
                }
                LintValidator::SchemaValidation => {
                    match AnyPayload::from_value(record_type, envelope.payload.clone())
                        .and_then(|p| p.to_value())
                    {
                        Ok(normalized) => {
                            envelope.payload = normalized;
                            resign = true;
                            planned.push((r, "filled default fields".to_string()));
                        }
                        Err(e) => done.push(attempt(r, false, "skipped".to_string(), Some(e.to_string()))),
                    }
                }
                LintValidator::BidirectionalConsistency => {
                    match add_back_link(record_type, &mut envelope.payload, r.target.as_deref()) {
                        Ok(action) => {
                            resign = true;
                            planned.push((r, action));
                        }
                        Err(e) => done.push(attempt(r, false, "skipped".to_string(), Some(e))),
                    }
                }
                LintValidator::ChecksumVerification => {
                    resign = true;
                    planned.push((r, "recomputed payloadChecksum".to_string()));
                }
                LintValidator::SignatureStructure => {
                    resign = true;
                    planned.push((r, "appended repair signature".to_string()));
                }
                LintValidator::FileNaming => {
                    let id = envelope
                        .payload
                        .get("id")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string);
                    match id {
                        Some(id) => {
                            let target = self.store.record_path(record_type, &id);
                            if target != path && target.exists() {
                                done.push(attempt(
                                    r,
                                    false,
                                    "skipped".to_string(),
                                    Some(format!("{} already exists", self.store.relative_path(&target))),
                                ));
                            } else {
                                planned.push((
                                    r,
                                    format!("renamed to {}", self.store.relative_path(&target)),
                                ));
                                rename_to = Some(target);
                            }
                        }
                        None => done.push(attempt(
                            r,
                            false,
                            "skipped".to_string(),
                            Some("payload has no id".to_string()),
                        )),
                    }
                }
                LintValidator::ReferentialIntegrity | LintValidator::ActorResolution => {
                    done.push(attempt(
                        r,
                        false,
                        "skipped".to_string(),
                        Some(format!("not auto-fixable: {}", r.validator.manual_remediation())),
                    ));
                }
            }
        }

        if planned.is_empty() {
            return done;
        }
        if resign && let Some(Ok(signer)) = signer {
            let validators: Vec<&str> = planned.iter().map(|(r, _)| r.validator.as_str()).collect();
            let checksum = crypto::compute_checksum(&envelope.payload);
            let signature = signer.sign(
                &checksum,
                REPAIR_ROLE,
                Some(&format!("lint fix: {}", validators.join(", "))),
            );
            envelope.header.payload_checksum = checksum;
            envelope = envelope.with_signature(signature);
            changed = true;
        }

        if run.dry_run {
            done.extend(
                planned
                    .into_iter()
                    .map(|(r, action)| attempt(r, true, format!("(dry run) {}", action), None)),
            );
            return done;
        }

        let outcome = run.backup(&path, rel).and_then(|backup| {
            if changed {
                store::write_envelope_file(&path, &envelope)?;
            }
            if let Some(target) = &rename_to {
                fs::rename(&path, target)?;
            }
            Ok(backup)
        });
        match outcome {
            Ok(backup) => done.extend(planned.into_iter().map(|(r, action)| FixAttempt {
                backup_path: Some(backup.display().to_string()),
                ..attempt(r, true, action, None)
            })),
            Err(e) => {
                let msg = e.to_string();
                done.extend(
                    planned
                        .into_iter()
                        .map(|(r, action)| attempt(r, false, action, Some(msg.clone()))),
                );
            }
        }
        done
    }
}

struct FixRun {
    backup_root: PathBuf,
    dry_run: bool,
    backups_created: usize,
}

impl FixRun {
    /// Copy `path` under this run's backup directory, mirroring `rel`.
    fn backup(&mut self, path: &Path, rel: &str) -> Result<PathBuf, GitgovError> {
        let dest = self.backup_root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &dest)?;
        self.backups_created += 1;
        Ok(dest)
    }
}

/// Keys the canonical form of `parsed` has but the stored payload lacks.
fn missing_default_fields(raw: &JsonValue, parsed: &AnyPayload) -> Vec<String> {
    let (Some(stored), Ok(JsonValue::Object(normalized))) = (raw.as_object(), parsed.to_value()) else {
        return Vec::new();
    };
    let mut missing: Vec<String> = normalized
        .keys()
        .filter(|k| !stored.contains_key(*k))
        .cloned()
        .collect();
    missing.sort();
    missing
}

/// `(message, id to add)` for each task/cycle link recorded on one side only.
fn missing_back_links(payload: &AnyPayload, ctx: &LintContext) -> Vec<(String, String)> {
    let mut out = Vec::new();
    match payload {
        AnyPayload::Cycle(cycle) => {
            for task_id in ctx.tasks_claiming_cycle.get(&cycle.id).into_iter().flatten() {
                if !cycle.task_ids.contains(task_id) {
                    out.push((
                        format!("task {} lists this cycle but taskIds does not include it", task_id),
                        task_id.clone(),
                    ));
                }
            }
        }
        AnyPayload::Task(task) => {
            for cycle_id in ctx.cycles_listing_task.get(&task.id).into_iter().flatten() {
                if !task.cycle_ids.contains(cycle_id) {
                    out.push((
                        format!("cycle {} lists this task but cycleIds does not include it", cycle_id),
                        cycle_id.clone(),
                    ));
                }
            }
        }
        _ => {}
    }
    out.sort();
    out.dedup();
    out
}

fn add_back_link(
    record_type: RecordType,
    payload: &mut JsonValue,
    target: Option<&str>,
) -> Result<String, String> {
    let target = target.ok_or("result carries no link target")?.to_string();
    match record_type {
        RecordType::Cycle => {
            let mut cycle: CycleRecord =
                serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
            if !cycle.task_ids.contains(&target) {
                cycle.task_ids.push(target.clone());
            }
            *payload = serde_json::to_value(&cycle).map_err(|e| e.to_string())?;
            Ok(format!("added task {} to taskIds", target))
        }
        RecordType::Task => {
            let mut task: TaskRecord =
                serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
            if !task.cycle_ids.contains(&target) {
                task.cycle_ids.push(target.clone());
            }
            *payload = serde_json::to_value(&task).map_err(|e| e.to_string())?;
            Ok(format!("added cycle {} to cycleIds", target))
        }
        other => Err(format!("{} records carry no task/cycle links", other)),
    }
}

fn finish_report(
    files_checked: usize,
    mut results: Vec<LintResult>,
    options: &LintOptions,
    started: Instant,
) -> LintReport {
    results.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then(a.validator.as_str().cmp(b.validator.as_str()))
            .then(a.message.cmp(&b.message))
    });
    let summary = LintSummary {
        files_checked,
        errors: results.iter().filter(|r| r.level == LintLevel::Error).count(),
        warnings: results.iter().filter(|r| r.level == LintLevel::Warning).count(),
        fixable: results.iter().filter(|r| r.fixable).count(),
        execution_time: started.elapsed().as_millis() as u64,
    };
    let mut truncated = false;
    if let Some(max) = options.max_errors {
        let mut seen = 0;
        results.retain(|r| {
            if r.level != LintLevel::Error {
                return true;
            }
            seen += 1;
            seen <= max
        });
        truncated = summary.errors > max;
    }
    LintReport {
        summary,
        results,
        truncated,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LintFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(name = "lint", about = "Validate record files and repair fixable violations")]
pub struct LintCli {
    /// A single record file; defaults to the whole store.
    pub path: Option<PathBuf>,
    #[clap(long)]
    pub fix: bool,
    /// Restrict --fix to these validators (comma separated).
    #[clap(long, value_delimiter = ',', value_parser = parse_validator)]
    pub fix_validators: Vec<LintValidator>,
    /// List legacy-format records without fixing anything.
    #[clap(long, conflicts_with = "fix")]
    pub check_migrations: bool,
    #[clap(long, value_enum, default_value = "text")]
    pub format: LintFormat,
    /// Print only the summary line.
    #[clap(long)]
    pub summary: bool,
    #[clap(long)]
    pub max_errors: Option<usize>,
}

pub fn run_lint_cli(
    engine: &LintEngine,
    indexer: &IndexerEngine,
    cli: LintCli,
    quiet: bool,
) -> Result<i32, GitgovError> {
    let options = LintOptions {
        validators: None,
        max_errors: cli.max_errors,
    };
    let report = if cli.check_migrations {
        engine.detect_migrations()?
    } else if let Some(path) = &cli.path {
        engine.lint_file(path, &options)?
    } else {
        engine.lint(&options)?
    };

    let mut fix_report = None;
    let mut final_report = report.clone();
    if cli.fix {
        let fix = engine.fix(
            &report,
            &FixOptions {
                fix_types: (!cli.fix_validators.is_empty()).then(|| cli.fix_validators.clone()),
                dry_run: false,
            },
        )?;
        if fix.summary.fixed > 0 {
            indexer.generate_index()?;
            final_report = match &cli.path {
                Some(path) if path.exists() => engine.lint_file(path, &options)?,
                _ => engine.lint(&options)?,
            };
        }
        fix_report = Some(fix);
    }

    let code = if final_report.summary.errors > 0 { 1 } else { 0 };
    match cli.format {
        LintFormat::Json => {
            let body = output::json_document(
                "lint",
                code == 0,
                serde_json::json!({ "report": report, "fix": fix_report }),
            );
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        LintFormat::Text if quiet => {}
        LintFormat::Text => {
            if !cli.summary {
                for r in &report.results {
                    println!(
                        "{} {} [{}] {}{}",
                        output::badge(r.level.as_str()),
                        r.file_path,
                        r.validator,
                        output::one_line(&r.message, output::MESSAGE_WIDTH),
                        if r.fixable { " (fixable)" } else { "" }
                    );
                }
                if report.truncated {
                    println!("(output truncated by --max-errors)");
                }
            }
            let s = &report.summary;
            println!(
                "{} files, {} errors, {} warnings, {} fixable",
                s.files_checked, s.errors, s.warnings, s.fixable
            );
            if let Some(fix) = &fix_report {
                println!(
                    "fixed {}, failed {}, backups {}",
                    fix.summary.fixed, fix.summary.failed, fix.summary.backups_created
                );
                let errors: Vec<String> = fix
                    .fixes
                    .iter()
                    .filter_map(|f| f.error.as_ref().map(|e| format!("{} {}: {}", f.file_path, f.validator, e)))
                    .collect();
                if !errors.is_empty() {
                    println!("{}", output::indented_list(&errors, 5));
                }
            } else if report.results.iter().any(|r| r.validator == LintValidator::ChecksumVerification) {
                if let Some(hint) = GitgovError::IntegrityViolation(String::new()).remediation() {
                    println!("hint: {}", hint);
                }
            }
        }
    }
    Ok(code)
}
