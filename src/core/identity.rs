//! Identity collaborators: who an actor is, and where their private key lives.
//!
//! The engines only see the two traits. The file-backed implementations here
//! resolve actors from the record store and keys from `.gitgov/keys/`, which
//! is never synced.

use crate::core::config::GitgovConfig;
use crate::core::crypto::{self, Signer};
use crate::core::error::GitgovError;
use crate::core::schemas::{ActorRecord, ActorStatus, ActorType, RecordEnvelope};
use crate::core::store::{self, RecordStore};
use ed25519_dalek::SigningKey;
use std::fs;
use std::path::PathBuf;

pub const KEYS_DIR: &str = "keys";

pub trait IdentityResolver: Send + Sync {
    fn get_actor(&self, id: &str) -> Result<Option<ActorRecord>, GitgovError>;

    fn get_current_actor(&self) -> Result<ActorRecord, GitgovError>;
}

pub trait KeyProvider: Send + Sync {
    fn get_private_key(&self, actor_id: &str) -> Result<Option<SigningKey>, GitgovError>;
}

/// Resolves actors from the `actors/` directory of a record store.
pub struct StoreIdentityResolver {
    store: RecordStore,
    current_actor: Option<String>,
}

impl StoreIdentityResolver {
    pub fn new(store: RecordStore, current_actor: Option<String>) -> Self {
        Self {
            store,
            current_actor,
        }
    }

    pub fn from_config(store: RecordStore, config: &GitgovConfig) -> Self {
        let current = config.resolve_current_actor();
        Self::new(store, current)
    }
}

impl IdentityResolver for StoreIdentityResolver {
    fn get_actor(&self, id: &str) -> Result<Option<ActorRecord>, GitgovError> {
        Ok(self
            .store
            .read::<ActorRecord>(id)?
            .map(|envelope| envelope.payload))
    }

    fn get_current_actor(&self) -> Result<ActorRecord, GitgovError> {
        let id = self.current_actor.as_deref().ok_or_else(|| {
            GitgovError::NotFound(
                "no current actor configured (set GITGOV_ACTOR or current_actor)".to_string(),
            )
        })?;
        self.get_actor(id)?
            .ok_or_else(|| GitgovError::NotFound(format!("actor {}", id)))
    }
}

/// Private keys as base64 files under `<store>/keys/<actor-file-stem>.key`.
pub struct FsKeyProvider {
    dir: PathBuf,
}

impl FsKeyProvider {
    pub fn new(store: &RecordStore) -> Self {
        Self {
            dir: store.root.join(KEYS_DIR),
        }
    }

    fn key_path(&self, actor_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.key", store::file_stem_for_id(actor_id)))
    }

    pub fn store_private_key(&self, actor_id: &str, key: &SigningKey) -> Result<(), GitgovError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.key_path(actor_id), crypto::encode_private_key(key))?;
        Ok(())
    }
}

impl KeyProvider for FsKeyProvider {
    fn get_private_key(&self, actor_id: &str) -> Result<Option<SigningKey>, GitgovError> {
        let path = self.key_path(actor_id);
        if !path.exists() {
            return Ok(None);
        }
        let encoded = fs::read_to_string(&path)?;
        crypto::decode_private_key(&encoded).map(Some)
    }
}

/// Signer for `actor_id`, or `KeyUnavailable` when no private key is stored.
pub fn signer_for(keys: &dyn KeyProvider, actor_id: &str) -> Result<Signer, GitgovError> {
    keys.get_private_key(actor_id)?
        .map(|key| Signer::new(actor_id, key))
        .ok_or_else(|| GitgovError::KeyUnavailable(actor_id.to_string()))
}

/// Generate a keypair, write the self-signed actor record, and store the key.
pub fn create_actor(
    store: &RecordStore,
    keys: &FsKeyProvider,
    actor_type: ActorType,
    display_name: &str,
    roles: &[&str],
) -> Result<(RecordEnvelope<ActorRecord>, Signer), GitgovError> {
    let id = format!("{}{}", actor_type.id_prefix(), store::slugify(display_name));
    let key = crypto::generate_keypair();
    let signer = Signer::new(id.clone(), key.clone());
    let actor = ActorRecord {
        id: id.clone(),
        actor_type,
        display_name: display_name.to_string(),
        public_key: signer.public_key(),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        status: ActorStatus::Active,
        superseded_by: None,
    };
    let envelope = store.create(actor, &signer)?;
    keys.store_private_key(&id, &key)?;
    tracing::info!(actor = %id, "actor created");
    Ok((envelope, signer))
}
