//! State-branch synchronization.
//!
//! The synced part of `.gitgov/` (record directories plus `index.json`) is
//! the payload of commits on one orphan branch. Every tree is built through
//! a private index file with `.gitgov/` as the work tree, so the caller's
//! checked-out branch, index and working files outside `.gitgov/` are never
//! touched.
//!
//! Divergence is never merged silently. `pull_state` records a rebase marker
//! under the git dir and refuses further push/pull until `resolve` rebuilds
//! the local side on top of the fetched tip.

use crate::core::config::{self, SyncConfig};
use crate::core::error::GitgovError;
use crate::core::git::{
    ChangeStatus, CommitAuthor, EMPTY_TREE, FileChange, GitPrimitives, SystemGitExecutor,
};
use crate::core::integrity;
use crate::core::identity::{IdentityResolver, StoreIdentityResolver};
use crate::core::output;
use crate::core::schemas::RecordType;
use crate::core::store::RecordStore;
use crate::core::time;
use crate::plugins::indexer::{INDEX_FILE, IndexerEngine, IntegrityStatus};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Directory under the git dir holding sync bookkeeping.
pub const SYNC_STATE_DIR: &str = "gitgov";
pub const REBASE_MARKER: &str = "rebase.json";
const SYSTEM_ACTOR: &str = "gitgov";

/// Top-level entries of `.gitgov/` that travel on the state branch.
pub fn synced_paths() -> Vec<&'static str> {
    let mut paths: Vec<&'static str> = RecordType::ALL.iter().map(|t| t.dir_name()).collect();
    paths.push(INDEX_FILE);
    paths
}

fn is_synced(rel: &str) -> bool {
    let top = rel.split('/').next().unwrap_or(rel);
    synced_paths().contains(&top)
}

/// Written by `pull_state` on divergence; removed by `resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseState {
    /// Fetched remote tip the local side is rebuilt onto.
    pub onto: String,
    pub local: String,
    pub base: Option<String>,
    pub conflicting_files: Vec<String>,
    pub started_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResult {
    pub success: bool,
    /// `local`, `remote`, or `existing` when the tree was already present.
    pub source: Option<String>,
    pub commit: Option<String>,
    pub files: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub actor_id: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub success: bool,
    pub dry_run: bool,
    pub changes: Vec<FileChange>,
    pub commit: Option<String>,
    pub pushed: bool,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub success: bool,
    /// Local commit made for pending changes before fetching.
    pub local_commit: Option<String>,
    pub updated: bool,
    pub conflict: bool,
    pub conflicting_files: Vec<String>,
    pub tip: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResult {
    pub success: bool,
    pub commit: String,
    pub resolved_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub branch: String,
    pub local_tip: Option<String>,
    pub remote_configured: bool,
    pub rebase_in_progress: bool,
    pub pending_changes: Vec<FileChange>,
}

/// Private index file, removed when dropped.
struct TempIndex(PathBuf);

impl TempIndex {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempIndex {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
        let _ = fs::remove_file(self.0.with_extension("lock"));
    }
}

pub struct SyncEngine {
    git: GitPrimitives,
    store: RecordStore,
    config: SyncConfig,
    indexer: Arc<IndexerEngine>,
    identity: Arc<dyn IdentityResolver>,
    default_actor: Option<String>,
}

impl SyncEngine {
    pub fn new(
        git: GitPrimitives,
        store: RecordStore,
        config: SyncConfig,
        indexer: Arc<IndexerEngine>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            git,
            store,
            config,
            indexer,
            identity,
            default_actor: None,
        }
    }

    /// Engine for the repository containing `project_root`, using the real
    /// git binary and the project's configuration.
    pub fn for_project(project_root: &Path) -> Result<Self, GitgovError> {
        let probe = RecordStore::for_project(project_root);
        let cfg = config::load_config(&probe.root)?;
        let timeout = Duration::from_secs(cfg.sync.git_timeout_secs);
        let git = GitPrimitives::discover(Arc::new(SystemGitExecutor), project_root, timeout)?;
        let store = RecordStore::for_project(git.repo_root());
        let identity = Arc::new(StoreIdentityResolver::from_config(store.clone(), &cfg));
        let indexer = Arc::new(
            IndexerEngine::for_store(store.clone())?.with_git(git.clone(), cfg.sync.state_branch.clone()),
        );
        Ok(Self::new(git, store, cfg.sync.clone(), indexer, identity)
            .with_default_actor(cfg.resolve_current_actor()))
    }

    /// Author for commits made outside `push_state` (pull, resolve).
    pub fn with_default_actor(mut self, actor_id: Option<String>) -> Self {
        self.default_actor = actor_id;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    fn branch(&self) -> &str {
        &self.config.state_branch
    }

    fn tracking_ref(&self) -> String {
        GitPrimitives::remote_tracking_ref(&self.config.remote, &self.config.state_branch)
    }

    fn author(&self, actor_id: Option<&str>) -> CommitAuthor {
        CommitAuthor::for_actor(
            actor_id
                .or(self.default_actor.as_deref())
                .unwrap_or(SYSTEM_ACTOR),
        )
    }

    fn state_dir(&self) -> Result<PathBuf, GitgovError> {
        let dir = self.git.git_dir()?.join(SYNC_STATE_DIR);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn temp_index(&self) -> Result<TempIndex, GitgovError> {
        Ok(TempIndex(
            self.state_dir()?
                .join(format!("index-{}", time::new_run_id())),
        ))
    }

    fn marker_path(&self) -> Result<PathBuf, GitgovError> {
        Ok(self.state_dir()?.join(REBASE_MARKER))
    }

    pub fn is_rebase_in_progress(&self) -> Result<bool, GitgovError> {
        Ok(self.marker_path()?.exists())
    }

    pub fn rebase_state(&self) -> Result<Option<RebaseState>, GitgovError> {
        let path = self.marker_path()?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    fn refuse_during_rebase(&self) -> Result<(), GitgovError> {
        if self.is_rebase_in_progress()? {
            return Err(GitgovError::SyncConflict(
                "a state rebase is in progress; edit the conflicting records and run `gitgov sync resolve` first".to_string(),
            ));
        }
        Ok(())
    }

    fn remote_available(&self) -> Result<bool, GitgovError> {
        self.git.is_remote_configured(&self.config.remote)
    }

    fn has_local_records(&self) -> Result<bool, GitgovError> {
        Ok(self.store.exists() && !self.store.record_paths()?.is_empty())
    }

    /// Make sure the local state branch exists. Returns the local tip.
    ///
    /// An empty working copy adopts the remote branch and materializes it.
    /// A working copy holding records that were never synced keeps them on a
    /// parentless history of its own, so the remote tip is never diffed
    /// against them: the next push is rejected and pull reports a divergence
    /// for `resolve`. With no remote branch an orphan history is started.
    pub fn ensure_state_branch(&self) -> Result<String, GitgovError> {
        let branch = self.branch();
        if self.git.branch_exists(branch)? {
            return self
                .git
                .rev_parse(branch)?
                .ok_or_else(|| GitgovError::Git(format!("branch {} has no commit", branch)));
        }
        if self.remote_available()? && self.git.remote_branch_exists(&self.config.remote, branch)? {
            self.git.fetch(&self.config.remote, branch)?;
            if let Some(tip) = self.git.rev_parse(&self.tracking_ref())? {
                if self.has_local_records()? {
                    let local = self.git.create_orphan_branch(branch, &self.author(None))?;
                    tracing::warn!(
                        branch,
                        remote_tip = %tip,
                        "local records were never synced; keeping a separate history until pull and resolve"
                    );
                    return Ok(local);
                }
                self.git.update_ref(branch, &tip, None)?;
                self.materialize(&tip)?;
                self.indexer.invalidate_cache()?;
                tracing::info!(branch, tip = %tip, "adopted remote state branch");
                return Ok(tip);
            }
        }
        let tip = self.git.create_orphan_branch(branch, &self.author(None))?;
        tracing::info!(branch, tip = %tip, "created orphan state branch");
        Ok(tip)
    }

    /// Recreate `.gitgov/` from the state branch when the working copy has
    /// none. Fails closed when the branch exists nowhere.
    pub fn bootstrap_from_state_branch(&self) -> Result<BootstrapResult, GitgovError> {
        if self.has_local_records()? {
            return Ok(BootstrapResult {
                success: true,
                source: Some("existing".to_string()),
                ..BootstrapResult::default()
            });
        }

        let branch = self.branch();
        let (tip, source) = if self.git.branch_exists(branch)? {
            (self.git.rev_parse(branch)?, "local")
        } else if self.remote_available()?
            && self.git.remote_branch_exists(&self.config.remote, branch)?
        {
            self.git.fetch(&self.config.remote, branch)?;
            let tip = self.git.rev_parse(&self.tracking_ref())?;
            if let Some(tip) = &tip {
                self.git.update_ref(branch, tip, None)?;
            }
            (tip, "remote")
        } else {
            (None, "none")
        };

        let Some(tip) = tip else {
            tracing::warn!(branch, "no state branch locally or on the remote");
            return Ok(BootstrapResult {
                success: false,
                error: Some(format!(
                    "state branch {} not found locally or on {}; project is uninitialized",
                    branch, self.config.remote
                )),
                ..BootstrapResult::default()
            });
        };

        let files = self.materialize(&tip)?;
        self.store.init()?;
        self.indexer.invalidate_cache()?;
        tracing::info!(source, tip = %tip, files, "bootstrapped record tree");
        Ok(BootstrapResult {
            success: true,
            source: Some(source.to_string()),
            commit: Some(tip),
            files,
            error: None,
        })
    }

    /// Local-only diff of the working record tree against the state branch.
    pub fn get_pending_changes(&self) -> Result<Vec<FileChange>, GitgovError> {
        if !self.store.exists() {
            return Err(GitgovError::Uninitialized(format!(
                "no record store at {}",
                self.store.root.display()
            )));
        }
        let base = if self.git.branch_exists(self.branch())? {
            self.git.tree_of(self.branch())?
        } else {
            EMPTY_TREE.to_string()
        };
        let work = self.working_tree()?;
        self.git.diff_name_status(&base, &work)
    }

    fn working_tree(&self) -> Result<String, GitgovError> {
        let index = self.temp_index()?;
        self.git
            .write_tree_from_dir(index.path(), &self.store.root, &synced_paths())
    }

    /// Commit the working tree on the state branch if it differs from the tip.
    fn commit_pending(&self, actor_id: Option<&str>) -> Result<Option<(String, Vec<FileChange>)>, GitgovError> {
        let tip = self.ensure_state_branch()?;
        let tree = self.working_tree()?;
        let changes = self.git.diff_name_status(&self.git.tree_of(&tip)?, &tree)?;
        if changes.is_empty() {
            return Ok(None);
        }
        let author = self.author(actor_id);
        let message = format!(
            "gitgov: sync {} change(s) by {}",
            changes.len(),
            author.name
        );
        let commit = self.git.commit_tree(&tree, &[&tip], &message, &author)?;
        self.git.update_ref(self.branch(), &commit, Some(&tip))?;
        tracing::info!(commit = %commit, changes = changes.len(), "committed state");
        Ok(Some((commit, changes)))
    }

    pub fn push_state(&self, options: &PushOptions) -> Result<PushResult, GitgovError> {
        self.refuse_during_rebase()?;
        if options.actor_id.trim().is_empty() {
            return Err(GitgovError::ValidationError(
                "push requires an actor id".to_string(),
            ));
        }
        if self.identity.get_actor(&options.actor_id)?.is_none() {
            return Err(GitgovError::NotFound(format!("actor {}", options.actor_id)));
        }

        if options.dry_run {
            let changes = self.get_pending_changes()?;
            return Ok(PushResult {
                success: true,
                dry_run: true,
                message: format!("{} pending change(s)", changes.len()),
                changes,
                ..PushResult::default()
            });
        }

        let integrity = self.indexer.validate_integrity()?;
        if integrity.status == IntegrityStatus::Errors {
            return Err(GitgovError::IntegrityViolation(format!(
                "{} checksum failure(s), {} signature failure(s), {} schema error(s); refusing to publish",
                integrity.checksum_failures, integrity.signature_failures, integrity.schema_errors
            )));
        }

        let committed = self.commit_pending(Some(&options.actor_id))?;
        let (commit, changes) = match committed {
            Some((commit, changes)) => (Some(commit), changes),
            None => (None, Vec::new()),
        };

        if !self.remote_available()? {
            return Ok(PushResult {
                success: true,
                message: format!(
                    "no remote {} configured; committed locally only",
                    self.config.remote
                ),
                changes,
                commit,
                ..PushResult::default()
            });
        }

        let attempts = self.push_with_retry()?;
        Ok(PushResult {
            success: true,
            message: if commit.is_some() {
                format!("pushed {} change(s)", changes.len())
            } else {
                "nothing to commit; remote is current".to_string()
            },
            changes,
            commit,
            pushed: true,
            attempts,
            dry_run: false,
        })
    }

    fn push_with_retry(&self) -> Result<u32, GitgovError> {
        let max = self.config.push_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.git.push_with_upstream(&self.config.remote, self.branch()) {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_retryable() && attempt < max => {
                    let wait = Duration::from_millis(self.config.push_backoff_ms * attempt as u64);
                    tracing::warn!(attempt, max, error = %e, wait_ms = wait.as_millis() as u64, "push failed; retrying");
                    thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pull_state(&self) -> Result<PullResult, GitgovError> {
        self.refuse_during_rebase()?;
        if !self.remote_available()? {
            return Ok(PullResult {
                success: true,
                message: format!("no remote {} configured", self.config.remote),
                ..PullResult::default()
            });
        }
        if !self.store.exists() {
            return Err(GitgovError::Uninitialized(
                "no record tree; run bootstrap first".to_string(),
            ));
        }

        let local_commit = self.commit_pending(None)?.map(|(commit, _)| commit);
        let branch = self.branch();
        if !self.git.remote_branch_exists(&self.config.remote, branch)? {
            return Ok(PullResult {
                success: true,
                local_commit,
                message: format!("{} has no {} yet; push to publish", self.config.remote, branch),
                ..PullResult::default()
            });
        }
        self.git.fetch(&self.config.remote, branch)?;

        let local = self
            .git
            .rev_parse(branch)?
            .ok_or_else(|| GitgovError::Git(format!("branch {} vanished", branch)))?;
        let remote = self
            .git
            .rev_parse(&self.tracking_ref())?
            .ok_or_else(|| GitgovError::Git(format!("fetch produced no {}", self.tracking_ref())))?;

        if local == remote || self.git.is_ancestor(&remote, &local)? {
            return Ok(PullResult {
                success: true,
                local_commit,
                tip: Some(local),
                message: "already up to date".to_string(),
                ..PullResult::default()
            });
        }

        if self.git.is_ancestor(&local, &remote)? {
            self.git.update_ref(branch, &remote, Some(&local))?;
            self.materialize(&remote)?;
            self.indexer.invalidate_cache()?;
            tracing::info!(from = %local, to = %remote, "fast-forwarded state");
            return Ok(PullResult {
                success: true,
                local_commit,
                updated: true,
                tip: Some(remote),
                message: "fast-forwarded".to_string(),
                ..PullResult::default()
            });
        }

        let base = self.git.merge_base(&local, &remote)?;
        let base_tree = base.as_deref().unwrap_or(EMPTY_TREE);
        let ours: BTreeSet<String> = self
            .git
            .diff_name_status(base_tree, &local)?
            .into_iter()
            .map(|c| c.file)
            .collect();
        let theirs: BTreeSet<String> = self
            .git
            .diff_name_status(base_tree, &remote)?
            .into_iter()
            .map(|c| c.file)
            .collect();
        let conflicting_files: Vec<String> = ours
            .intersection(&theirs)
            .filter(|f| f.as_str() != INDEX_FILE)
            .cloned()
            .collect();
        let state = RebaseState {
            onto: remote.clone(),
            local: local.clone(),
            base,
            conflicting_files: conflicting_files.clone(),
            started_at: time::now_epoch_secs(),
        };
        fs::write(self.marker_path()?, serde_json::to_string_pretty(&state)?)?;
        tracing::warn!(conflicts = conflicting_files.len(), "state histories diverged; rebase required");
        Ok(PullResult {
            success: false,
            local_commit,
            conflict: true,
            conflicting_files,
            tip: Some(local),
            message: "local and remote state diverged; edit the listed records, then run `gitgov sync resolve`".to_string(),
            ..PullResult::default()
        })
    }

    /// Finish a pending rebase: the fetched tip plus every local-side change,
    /// with the working copy deciding conflicting paths.
    pub fn resolve(&self) -> Result<ResolveResult, GitgovError> {
        let state = self.rebase_state()?.ok_or_else(|| {
            GitgovError::ValidationError("no state rebase in progress".to_string())
        })?;

        for rel in &state.conflicting_files {
            let path = self.store.root.join(rel);
            if !path.exists() {
                continue;
            }
            let record_type = rel
                .split('/')
                .next()
                .and_then(RecordType::from_dir_name)
                .ok_or_else(|| GitgovError::PathError(format!("{} is not a record path", rel)))?;
            let raw = self.store.read_raw_path(record_type, &path)?;
            let check = integrity::check_envelope(&raw.envelope, self.identity.as_ref())?;
            if !check.is_clean() {
                return Err(GitgovError::IntegrityViolation(format!(
                    "{} does not verify after editing; re-sign it before resolving",
                    rel
                )));
            }
        }

        let base_tree = state.base.as_deref().unwrap_or(EMPTY_TREE);
        let work = self.working_tree()?;
        let local_side = self.git.diff_name_status(base_tree, &work)?;
        let (removed, taken): (Vec<FileChange>, Vec<FileChange>) = local_side
            .into_iter()
            .filter(|c| c.file != INDEX_FILE)
            .partition(|c| c.status == ChangeStatus::Deleted);
        let take: Vec<String> = taken.into_iter().map(|c| c.file).collect();
        let remove: Vec<String> = removed.into_iter().map(|c| c.file).collect();

        let index = self.temp_index()?;
        let tree = self
            .git
            .compose_tree(index.path(), &self.store.root, &state.onto, &take, &remove)?;
        let commit = self.git.commit_tree(
            &tree,
            &[&state.onto],
            "gitgov: rebase local state onto remote",
            &self.author(None),
        )?;
        let current = self.git.rev_parse(self.branch())?;
        self.git
            .update_ref(self.branch(), &commit, current.as_deref())?;
        self.materialize(&commit)?;
        self.indexer.invalidate_cache()?;
        fs::remove_file(self.marker_path()?)?;

        let mut resolved_files: Vec<String> = take.into_iter().chain(remove).collect();
        resolved_files.sort();
        tracing::info!(commit = %commit, files = resolved_files.len(), "state rebase resolved");
        Ok(ResolveResult {
            success: true,
            commit,
            resolved_files,
        })
    }

    pub fn status(&self) -> Result<SyncStatus, GitgovError> {
        let branch = self.branch().to_string();
        let local_tip = self.git.rev_parse(&branch)?;
        Ok(SyncStatus {
            local_tip,
            remote_configured: self.remote_available()?,
            rebase_in_progress: self.is_rebase_in_progress()?,
            pending_changes: if self.store.exists() {
                self.get_pending_changes()?
            } else {
                Vec::new()
            },
            branch,
        })
    }

    /// Make the synced part of `.gitgov/` match `rev`: delete files the tree
    /// lacks, then check out its contents. Returns the number of files.
    fn materialize(&self, rev: &str) -> Result<usize, GitgovError> {
        let wanted: BTreeSet<String> = self.git.list_tree(rev)?.into_iter().collect();
        if self.store.exists() {
            let mut on_disk: Vec<PathBuf> = self
                .store
                .record_paths()?
                .into_iter()
                .map(|(_, p)| p)
                .collect();
            on_disk.push(self.store.root.join(INDEX_FILE));
            for path in on_disk {
                let rel = self.store.relative_path(&path);
                if path.exists() && is_synced(&rel) && !wanted.contains(&rel) {
                    fs::remove_file(&path)?;
                }
            }
        }
        fs::create_dir_all(&self.store.root)?;
        let index = self.temp_index()?;
        self.git
            .checkout_tree_into(index.path(), rev, &self.store.root)?;
        Ok(wanted.len())
    }
}

#[derive(Parser, Debug)]
#[clap(name = "sync", about = "Replicate the record tree through the state branch")]
pub struct SyncCli {
    #[clap(subcommand)]
    pub command: SyncCommand,
    #[clap(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Commit pending record changes and push them.
    Push {
        /// Acting actor; defaults to the configured current actor.
        #[clap(long)]
        actor: Option<String>,
        #[clap(long)]
        dry_run: bool,
    },
    /// Fetch remote state and fast-forward, or flag divergence.
    Pull,
    /// Finish a rebase after editing the conflicting records.
    Resolve,
    /// Recreate `.gitgov/` from the state branch.
    Bootstrap,
    /// Branch tip, remote, rebase state and pending changes.
    Status,
}

pub fn run_sync_cli(
    engine: &SyncEngine,
    cli: SyncCli,
    current_actor: Option<String>,
    quiet: bool,
) -> Result<i32, GitgovError> {
    let emit = |cmd: &str, ok: bool, value: serde_json::Value, text: String| -> Result<i32, GitgovError> {
        if cli.json {
            let body = output::json_document(cmd, ok, value);
            println!("{}", serde_json::to_string_pretty(&body)?);
        } else if !quiet {
            println!("{}", text);
        }
        Ok(if ok { 0 } else { 1 })
    };

    match &cli.command {
        SyncCommand::Push { actor, dry_run } => {
            let actor_id = actor.clone().or(current_actor).ok_or_else(|| {
                GitgovError::ValidationError(
                    "no actor: pass --actor or set GITGOV_ACTOR".to_string(),
                )
            })?;
            let result = engine.push_state(&PushOptions {
                actor_id,
                dry_run: *dry_run,
            })?;
            let files: Vec<String> = result
                .changes
                .iter()
                .map(|c| format!("{} {}", c.status.as_str(), c.file))
                .collect();
            let text = if files.is_empty() {
                result.message.clone()
            } else {
                format!("{}\n{}", result.message, output::indented_list(&files, 10))
            };
            emit("sync.push", result.success, serde_json::json!({ "result": result }), text)
        }
        SyncCommand::Pull => {
            let result = engine.pull_state()?;
            let mut text = result.message.clone();
            if result.conflict {
                text.push_str("\nconflicting:\n");
                text.push_str(&output::indented_list(&result.conflicting_files, 10));
            }
            emit("sync.pull", result.success, serde_json::json!({ "result": result }), text)
        }
        SyncCommand::Resolve => {
            let result = engine.resolve()?;
            let text = format!(
                "resolved {} file(s) at {}",
                result.resolved_files.len(),
                result.commit
            );
            emit("sync.resolve", result.success, serde_json::json!({ "result": result }), text)
        }
        SyncCommand::Bootstrap => {
            let result = engine.bootstrap_from_state_branch()?;
            let text = match (&result.error, &result.source) {
                (Some(e), _) => e.clone(),
                (None, Some(source)) => format!("bootstrapped {} file(s) from {}", result.files, source),
                (None, None) => "nothing to do".to_string(),
            };
            emit("sync.bootstrap", result.success, serde_json::json!({ "result": result }), text)
        }
        SyncCommand::Status => {
            let status = engine.status()?;
            let text = format!(
                "branch {} at {}; remote {}; {} pending change(s){}",
                status.branch,
                status.local_tip.as_deref().unwrap_or("(none)"),
                if status.remote_configured { "configured" } else { "not configured" },
                status.pending_changes.len(),
                if status.rebase_in_progress { "; rebase in progress" } else { "" }
            );
            emit("sync.status", true, serde_json::json!({ "status": status }), text)
        }
    }
}
