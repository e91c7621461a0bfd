//! gitgov: a local-first, git-backed governance ledger.
//!
//! Every governance artifact (task, cycle, feedback, execution, changelog,
//! actor, agent) is a signed JSON record under `<repo>/.gitgov/`. Records are
//! the source of truth; everything else is derived or transported.
//!
//! # Engines
//!
//! - [`plugins::indexer`]: derives a queryable snapshot (`index.json`) with
//!   enriched tasks, health scores and an activity feed, and re-verifies
//!   checksums and signatures.
//! - [`plugins::lint`]: validates record files and repairs the fixable
//!   violations behind a backup.
//! - [`plugins::sync`]: replicates the record tree through a dedicated
//!   orphan branch without touching the working branch.
//!
//! # Examples
//!
//! ```bash
//! # Rebuild the cache if any record changed
//! gitgov indexer
//!
//! # Verify integrity only
//! gitgov indexer --validate-only --json
//!
//! # Lint and repair stale checksums
//! gitgov lint --fix --fix-validators=CHECKSUM_VERIFICATION
//!
//! # Publish local record changes
//! GITGOV_ACTOR=human:ada gitgov sync push
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: record store, schemas, crypto, identity, git plumbing, config
//! - [`plugins`]: the indexer, lint and sync engines

pub mod core;
pub mod plugins;

use crate::core::{
    config, error::GitgovError, git::GitPrimitives, git::SystemGitExecutor,
    identity::FsKeyProvider, identity::StoreIdentityResolver, logging, store::GITGOV_DIR,
    store::RecordStore,
};
use crate::plugins::{indexer, lint, sync};

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    name = "gitgov",
    version = env!("CARGO_PKG_VERSION"),
    about = "Signed governance records, indexed, linted and synced through git"
)]
struct Cli {
    /// Debug-level diagnostics on stderr.
    #[clap(long, short, global = true)]
    verbose: bool,
    /// Errors only.
    #[clap(long, short, global = true)]
    quiet: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate, check or validate the index cache
    Indexer(indexer::IndexerCli),

    /// Validate record files and repair fixable violations
    Lint(lint::LintCli),

    /// Replicate records through the state branch
    Sync(sync::SyncCli),
}

impl Command {
    fn wants_json(&self) -> bool {
        match self {
            Command::Indexer(c) => c.json,
            Command::Lint(c) => c.format == lint::LintFormat::Json,
            Command::Sync(c) => c.json,
        }
    }
}

/// Nearest ancestor holding `.gitgov/`, else the enclosing git work tree,
/// else `start_dir` itself.
fn find_project_root(start_dir: &Path) -> PathBuf {
    let mut current = start_dir.to_path_buf();
    loop {
        if current.join(GITGOV_DIR).is_dir() {
            return current;
        }
        if !current.pop() {
            break;
        }
    }
    GitPrimitives::discover(
        Arc::new(SystemGitExecutor),
        start_dir,
        Duration::from_secs(10),
    )
    .map(|git| git.repo_root().to_path_buf())
    .unwrap_or_else(|_| start_dir.to_path_buf())
}

/// Parse arguments and dispatch. Returns the process exit code.
pub fn run() -> Result<i32, GitgovError> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    if cli.quiet && cli.command.wants_json() {
        eprintln!("error: --json output cannot be combined with --quiet");
        return Ok(2);
    }

    let project_root = find_project_root(&std::env::current_dir()?);
    let store = RecordStore::for_project(&project_root);
    tracing::debug!(root = %store.root.display(), "resolved record store");

    match cli.command {
        Command::Indexer(args) => {
            let engine = indexer::IndexerEngine::for_project(&project_root)?;
            indexer::run_indexer_cli(&engine, args, cli.quiet)
        }
        Command::Lint(args) => {
            let cfg = config::load_config(&store.root)?;
            let identity = Arc::new(StoreIdentityResolver::from_config(store.clone(), &cfg));
            let keys = Arc::new(FsKeyProvider::new(&store));
            let cache = Arc::new(indexer::IndexerEngine::new(
                store.clone(),
                cfg.index.clone(),
                identity.clone(),
            ));
            let engine = lint::LintEngine::new(store, identity, keys).with_cache(cache.clone());
            lint::run_lint_cli(&engine, &cache, args, cli.quiet)
        }
        Command::Sync(args) => {
            let cfg = config::load_config(&store.root)?;
            let engine = sync::SyncEngine::for_project(&project_root)?;
            sync::run_sync_cli(&engine, args, cfg.resolve_current_actor(), cli.quiet)
        }
    }
}
