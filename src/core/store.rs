//! File-backed record store.
//!
//! One directory per record type under the project's `.gitgov/` root, one
//! JSON envelope per entity at `<type>s/<id>.json`. The store is the only
//! authoritative state; everything in `plugins::indexer` is rebuilt from it.

use crate::core::crypto::{self, Signer};
use crate::core::error::GitgovError;
use crate::core::schemas::{
    CURRENT_SCHEMA_VERSION, RecordEnvelope, RecordHeader, RecordPayload, RecordType,
};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const GITGOV_DIR: &str = ".gitgov";
pub const RECORD_EXT: &str = "json";
pub const AUTHOR_ROLE: &str = "author";
const MAX_SLUG_LEN: usize = 50;

/// Handle to a project's record tree.
#[derive(Debug, Clone)]
pub struct RecordStore {
    /// Absolute path to the `.gitgov` directory.
    pub root: PathBuf,
}

/// A record file read without committing to a payload type.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub path: PathBuf,
    pub record_type: RecordType,
    pub envelope: RecordEnvelope<JsonValue>,
}

impl RawRecord {
    pub fn payload_id(&self) -> Option<&str> {
        self.envelope.payload.get("id").and_then(JsonValue::as_str)
    }
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store for the project whose repository root is `project_root`.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(GITGOV_DIR))
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn init(&self) -> Result<(), GitgovError> {
        for t in RecordType::ALL {
            fs::create_dir_all(self.type_dir(t))?;
        }
        Ok(())
    }

    pub fn type_dir(&self, record_type: RecordType) -> PathBuf {
        self.root.join(record_type.dir_name())
    }

    pub fn record_path(&self, record_type: RecordType, id: &str) -> PathBuf {
        self.type_dir(record_type)
            .join(format!("{}.{}", file_stem_for_id(id), RECORD_EXT))
    }

    /// Path relative to the store root with forward slashes, e.g. `tasks/<id>.json`.
    pub fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Point-in-time listing of every record file, sorted by path.
    pub fn record_paths(&self) -> Result<Vec<(RecordType, PathBuf)>, GitgovError> {
        let mut out = Vec::new();
        for t in RecordType::ALL {
            for path in self.list_type_paths(t)? {
                out.push((t, path));
            }
        }
        out.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(out)
    }

    pub fn list_type_paths(&self, record_type: RecordType) -> Result<Vec<PathBuf>, GitgovError> {
        let dir = self.type_dir(record_type);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == RECORD_EXT) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Ids as encoded in file names. Cheap: no file contents are read.
    pub fn list_ids(&self, record_type: RecordType) -> Result<Vec<String>, GitgovError> {
        Ok(self
            .list_type_paths(record_type)?
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .map(|stem| id_for_file_stem(record_type, &stem))
            .collect())
    }

    pub fn read_raw_path(
        &self,
        record_type: RecordType,
        path: &Path,
    ) -> Result<RawRecord, GitgovError> {
        let content = fs::read_to_string(path)?;
        let envelope: RecordEnvelope<JsonValue> = serde_json::from_str(&content)?;
        Ok(RawRecord {
            path: path.to_path_buf(),
            record_type,
            envelope,
        })
    }

    pub fn read_raw(
        &self,
        record_type: RecordType,
        id: &str,
    ) -> Result<Option<RawRecord>, GitgovError> {
        let path = self.record_path(record_type, id);
        if !path.exists() {
            return Ok(None);
        }
        self.read_raw_path(record_type, &path).map(Some)
    }

    pub fn read<P: RecordPayload>(
        &self,
        id: &str,
    ) -> Result<Option<RecordEnvelope<P>>, GitgovError> {
        let path = self.record_path(P::RECORD_TYPE, id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Every record of one type. Fails on the first unreadable file; lint and
    /// the indexer use `record_paths` instead so one bad file cannot abort a scan.
    pub fn list<P: RecordPayload>(&self) -> Result<Vec<RecordEnvelope<P>>, GitgovError> {
        let mut out = Vec::new();
        for path in self.list_type_paths(P::RECORD_TYPE)? {
            let content = fs::read_to_string(&path)?;
            out.push(serde_json::from_str(&content)?);
        }
        Ok(out)
    }

    /// Sign and persist a new record. Refuses to overwrite an existing id.
    pub fn create<P: RecordPayload>(
        &self,
        payload: P,
        signer: &Signer,
    ) -> Result<RecordEnvelope<P>, GitgovError> {
        let path = self.record_path(P::RECORD_TYPE, payload.id());
        if path.exists() {
            return Err(GitgovError::ValidationError(format!(
                "{} {} already exists",
                P::RECORD_TYPE,
                payload.id()
            )));
        }
        let checksum = crypto::checksum_of(&payload)?;
        let signature = signer.sign(&checksum, AUTHOR_ROLE, None);
        let envelope = RecordEnvelope {
            header: RecordHeader {
                schema_version: CURRENT_SCHEMA_VERSION.to_string(),
                record_type: P::RECORD_TYPE,
                payload_checksum: checksum,
                signatures: vec![signature],
            },
            payload,
        };
        self.write(&envelope)?;
        Ok(envelope)
    }

    /// Persist an envelope at its canonical path.
    pub fn write<P: RecordPayload>(&self, envelope: &RecordEnvelope<P>) -> Result<(), GitgovError> {
        let path = self.record_path(P::RECORD_TYPE, envelope.payload.id());
        write_envelope_file(&path, envelope)
    }

    /// Signature-gated transition: a new envelope with `payload`, its checksum,
    /// and one more signature. The previous signatures are carried over unchanged.
    pub fn transition<P: RecordPayload>(
        &self,
        current: RecordEnvelope<P>,
        payload: P,
        signer: &Signer,
        role: &str,
        notes: Option<&str>,
    ) -> Result<RecordEnvelope<P>, GitgovError> {
        if current.payload.id() != payload.id() {
            return Err(GitgovError::ValidationError(format!(
                "transition cannot change id {} -> {}",
                current.payload.id(),
                payload.id()
            )));
        }
        let checksum = crypto::checksum_of(&payload)?;
        let signature = signer.sign(&checksum, role, notes);
        let mut header = current.header;
        header.payload_checksum = checksum;
        let next = RecordEnvelope { header, payload }.with_signature(signature);
        self.write(&next)?;
        Ok(next)
    }

    /// Approval without payload change.
    pub fn sign<P: RecordPayload>(
        &self,
        current: RecordEnvelope<P>,
        signer: &Signer,
        role: &str,
        notes: Option<&str>,
    ) -> Result<RecordEnvelope<P>, GitgovError> {
        let checksum = crypto::checksum_of(&current.payload)?;
        let signature = signer.sign(&checksum, role, notes);
        let next = current.with_signature(signature);
        self.write(&next)?;
        Ok(next)
    }

    pub fn delete(&self, record_type: RecordType, id: &str) -> Result<bool, GitgovError> {
        let path = self.record_path(record_type, id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

/// Pretty JSON with a trailing newline, written through a temp file.
pub fn write_envelope_file<T: serde::Serialize>(path: &Path, envelope: &T) -> Result<(), GitgovError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(envelope)?;
    body.push('\n');
    let tmp = path.with_extension(format!("{}.tmp", RECORD_EXT));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// `{creationEpochSeconds}-{type}-{slug}`.
pub fn generate_id(record_type: RecordType, title: &str, epoch_secs: u64) -> String {
    format!("{}-{}-{}", epoch_secs, record_type.as_str(), slugify(title))
}

fn timestamped_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{10,})-(task|cycle|feedback|execution|changelog)-([a-z0-9]+(?:-[a-z0-9]+)*)$")
            .expect("static regex")
    })
}

fn actor_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(human|agent):[a-z0-9]+(?:[-_.][a-z0-9]+)*$").expect("static regex")
    })
}

/// Whether `id` is well formed for `record_type`.
pub fn is_valid_id(record_type: RecordType, id: &str) -> bool {
    if record_type.uses_actor_ids() {
        return actor_id_regex().is_match(id);
    }
    timestamped_id_regex()
        .captures(id)
        .is_some_and(|caps| &caps[2] == record_type.as_str())
}

/// Creation time encoded in a timestamped id.
pub fn id_epoch(id: &str) -> Option<u64> {
    timestamped_id_regex()
        .captures(id)
        .and_then(|caps| caps[1].parse().ok())
}

/// Actor ids contain `:`, which is not portable in file names.
pub fn file_stem_for_id(id: &str) -> String {
    id.replace(':', "_")
}

pub fn id_for_file_stem(record_type: RecordType, stem: &str) -> String {
    if record_type.uses_actor_ids() {
        stem.replacen('_', ":", 1)
    } else {
        stem.to_string()
    }
}
