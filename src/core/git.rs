//! Git subprocess seam and the primitives the sync protocol is built on.
//!
//! Everything goes through `GitExecutor`, a narrow
//! `(command, args, options) -> {exit_code, stdout, stderr}` interface, so the
//! sync engine can be exercised with a scripted executor and no git binary.
//! Tree plumbing uses a private index file (`GIT_INDEX_FILE`) and an explicit
//! work tree, so the caller's checked-out branch and index are never touched.

use crate::core::error::GitgovError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

#[derive(Debug, Clone, Default)]
pub struct GitOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait GitExecutor: Send + Sync {
    fn exec(
        &self,
        command: &str,
        args: &[&str],
        options: &GitOptions,
    ) -> Result<GitOutput, GitgovError>;
}

/// Spawns the real binary. A run past `options.timeout` is killed and
/// reported as `GitTimeout`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemGitExecutor;

impl GitExecutor for SystemGitExecutor {
    fn exec(
        &self,
        command: &str,
        args: &[&str],
        options: &GitOptions,
    ) -> Result<GitOutput, GitgovError> {
        let started = Instant::now();
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &options.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (&options.stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match options.timeout {
            None => child.wait()?,
            Some(limit) => loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if started.elapsed() >= limit {
                    let _ = child.kill();
                    let _ = child.wait();
                    let rendered = format!("{} {}", command, args.join(" "));
                    tracing::warn!(command = %rendered, secs = limit.as_secs(), "git timed out");
                    return Err(GitgovError::GitTimeout {
                        command: rendered,
                        secs: limit.as_secs(),
                    });
                }
                thread::sleep(Duration::from_millis(10));
            },
        };

        let collect = |h: Option<thread::JoinHandle<Vec<u8>>>| {
            h.map(|h| h.join().unwrap_or_default())
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                .unwrap_or_default()
        };
        let output = GitOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        tracing::debug!(
            command,
            args = ?args,
            exit_code = output.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "git exec"
        );
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

impl ChangeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Added => "added",
            ChangeStatus::Modified => "modified",
            ChangeStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub status: ChangeStatus,
    pub file: String,
}

/// Commit identity passed through the environment, never through repo config.
#[derive(Debug, Clone)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    pub fn for_actor(actor_id: &str) -> Self {
        Self {
            name: actor_id.to_string(),
            email: format!("{}@gitgov.local", actor_id.replace(':', ".")),
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![
            ("GIT_AUTHOR_NAME".to_string(), self.name.clone()),
            ("GIT_AUTHOR_EMAIL".to_string(), self.email.clone()),
            ("GIT_COMMITTER_NAME".to_string(), self.name.clone()),
            ("GIT_COMMITTER_EMAIL".to_string(), self.email.clone()),
        ]
    }
}

/// Git operations over one repository, bounded by a timeout per call.
#[derive(Clone)]
pub struct GitPrimitives {
    executor: Arc<dyn GitExecutor>,
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitPrimitives {
    pub fn new(executor: Arc<dyn GitExecutor>, repo_root: PathBuf, timeout: Duration) -> Self {
        Self {
            executor,
            repo_root,
            timeout,
        }
    }

    /// Locate the repository containing `start_dir`.
    pub fn discover(
        executor: Arc<dyn GitExecutor>,
        start_dir: &Path,
        timeout: Duration,
    ) -> Result<Self, GitgovError> {
        let probe = Self::new(executor, start_dir.to_path_buf(), timeout);
        let root = probe.run_ok(&["rev-parse", "--show-toplevel"])?;
        Ok(Self::new(probe.executor, PathBuf::from(root), timeout))
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn options(&self) -> GitOptions {
        GitOptions {
            cwd: Some(self.repo_root.clone()),
            timeout: Some(self.timeout),
            ..GitOptions::default()
        }
    }

    pub fn run(&self, args: &[&str]) -> Result<GitOutput, GitgovError> {
        self.run_with(args, self.options())
    }

    fn run_with(&self, args: &[&str], options: GitOptions) -> Result<GitOutput, GitgovError> {
        self.executor.exec("git", args, &options)
    }

    fn run_ok(&self, args: &[&str]) -> Result<String, GitgovError> {
        self.run_ok_with(args, self.options())
    }

    fn run_ok_with(&self, args: &[&str], options: GitOptions) -> Result<String, GitgovError> {
        let output = self.run_with(args, options)?;
        if !output.success() {
            return Err(GitgovError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().to_string())
    }

    pub fn git_dir(&self) -> Result<PathBuf, GitgovError> {
        self.run_ok(&["rev-parse", "--absolute-git-dir"])
            .map(PathBuf::from)
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool, GitgovError> {
        let refname = format!("refs/heads/{}", name);
        Ok(self
            .run(&["show-ref", "--verify", "--quiet", &refname])?
            .success())
    }

    pub fn is_remote_configured(&self, remote: &str) -> Result<bool, GitgovError> {
        Ok(self.run(&["remote", "get-url", remote])?.success())
    }

    /// Asks the remote directly; this is a network call.
    pub fn remote_branch_exists(&self, remote: &str, name: &str) -> Result<bool, GitgovError> {
        let output = self.run(&["ls-remote", "--exit-code", "--heads", remote, name])?;
        match output.exit_code {
            0 => Ok(true),
            2 => Ok(false),
            _ => Err(classify_remote_failure("ls-remote", &output)),
        }
    }

    pub fn remote_tracking_ref(remote: &str, name: &str) -> String {
        format!("refs/remotes/{}/{}", remote, name)
    }

    pub fn fetch(&self, remote: &str, name: &str) -> Result<(), GitgovError> {
        let refspec = format!(
            "+refs/heads/{}:{}",
            name,
            Self::remote_tracking_ref(remote, name)
        );
        let output = self.run(&["fetch", "--no-tags", remote, &refspec])?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_remote_failure("fetch", &output))
        }
    }

    /// `git push -u <remote> <name>:<name>`. A rejected non-fast-forward is a
    /// `SyncConflict`; network-level failures are `TransientIo`.
    pub fn push_with_upstream(&self, remote: &str, name: &str) -> Result<(), GitgovError> {
        let refspec = format!("refs/heads/{}:refs/heads/{}", name, name);
        let output = self.run(&["push", "--porcelain", "-u", remote, &refspec])?;
        if output.success() {
            return Ok(());
        }
        let text = format!("{}\n{}", output.stdout, output.stderr);
        if text.contains("[rejected]") || text.contains("non-fast-forward") || text.contains("fetch first") {
            return Err(GitgovError::SyncConflict(format!(
                "remote {} rejected {}: histories diverged; pull first",
                remote, name
            )));
        }
        Err(classify_remote_failure("push", &output))
    }

    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>, GitgovError> {
        let spec = format!("{}^{{commit}}", rev);
        let output = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn tree_of(&self, rev: &str) -> Result<String, GitgovError> {
        self.run_ok(&["rev-parse", &format!("{}^{{tree}}", rev)])
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitgovError> {
        let output = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(GitgovError::Git(format!(
                "merge-base --is-ancestor failed: {}",
                output.stderr.trim()
            ))),
        }
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GitgovError> {
        let output = self.run(&["merge-base", a, b])?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn commit_tree(
        &self,
        tree: &str,
        parents: &[&str],
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String, GitgovError> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);
        let mut options = self.options();
        options.env = author.env();
        self.run_ok_with(&args, options)
    }

    /// Compare-and-swap ref update; `old = None` requires the ref to be absent.
    pub fn update_ref(&self, name: &str, new: &str, old: Option<&str>) -> Result<(), GitgovError> {
        let refname = format!("refs/heads/{}", name);
        let zero = "0".repeat(40);
        let old = old.unwrap_or(&zero);
        self.run_ok(&["update-ref", &refname, new, old]).map(|_| ())
    }

    /// A parentless branch whose first commit has an empty tree. Does not
    /// check the branch out.
    pub fn create_orphan_branch(
        &self,
        name: &str,
        author: &CommitAuthor,
    ) -> Result<String, GitgovError> {
        let mut options = self.options();
        options.stdin = Some(Vec::new());
        let tree = self.run_ok_with(&["mktree"], options)?;
        let commit = self.commit_tree(
            &tree,
            &[],
            &format!("gitgov: initialize {}", name),
            author,
        )?;
        self.update_ref(name, &commit, None)?;
        Ok(commit)
    }

    pub fn diff_name_status(&self, from: &str, to: &str) -> Result<Vec<FileChange>, GitgovError> {
        let out = self.run_ok(&["diff-tree", "-r", "--name-status", "--no-renames", from, to])?;
        Ok(parse_name_status(&out))
    }

    pub fn list_tree(&self, rev: &str) -> Result<Vec<String>, GitgovError> {
        let out = self.run_ok(&["ls-tree", "-r", "--name-only", rev])?;
        Ok(out
            .lines()
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect())
    }

    fn plumbing_options(&self, index_file: &Path, work_tree: &Path) -> GitOptions {
        GitOptions {
            cwd: Some(work_tree.to_path_buf()),
            env: vec![(
                "GIT_INDEX_FILE".to_string(),
                index_file.to_string_lossy().to_string(),
            )],
            timeout: Some(self.timeout),
            stdin: None,
        }
    }

    /// Tree object for `paths` under `work_tree`, staged through `index_file`.
    pub fn write_tree_from_dir(
        &self,
        index_file: &Path,
        work_tree: &Path,
        paths: &[&str],
    ) -> Result<String, GitgovError> {
        let git_dir = self.git_dir()?;
        let gd = format!("--git-dir={}", git_dir.display());
        let wt = format!("--work-tree={}", work_tree.display());
        let options = self.plumbing_options(index_file, work_tree);

        self.run_ok_with(&[&gd, &wt, "read-tree", "--empty"], options.clone())?;
        let present: Vec<&str> = paths
            .iter()
            .copied()
            .filter(|p| work_tree.join(p).exists())
            .collect();
        if !present.is_empty() {
            let mut args = vec![gd.as_str(), wt.as_str(), "add", "-A", "-f", "--"];
            args.extend(present);
            self.run_ok_with(&args, options.clone())?;
        }
        self.run_ok_with(&[&gd, &wt, "write-tree"], options)
    }

    /// Tree of `base` with `take` replaced by their `work_tree` versions and
    /// `remove` dropped.
    pub fn compose_tree(
        &self,
        index_file: &Path,
        work_tree: &Path,
        base: &str,
        take: &[String],
        remove: &[String],
    ) -> Result<String, GitgovError> {
        let git_dir = self.git_dir()?;
        let gd = format!("--git-dir={}", git_dir.display());
        let wt = format!("--work-tree={}", work_tree.display());
        let options = self.plumbing_options(index_file, work_tree);

        self.run_ok_with(&[&gd, &wt, "read-tree", base], options.clone())?;
        if !take.is_empty() {
            let mut args = vec![gd.as_str(), wt.as_str(), "add", "-f", "--"];
            args.extend(take.iter().map(String::as_str));
            self.run_ok_with(&args, options.clone())?;
        }
        if !remove.is_empty() {
            let mut args = vec![
                gd.as_str(),
                wt.as_str(),
                "rm",
                "--cached",
                "-q",
                "--ignore-unmatch",
                "--",
            ];
            args.extend(remove.iter().map(String::as_str));
            self.run_ok_with(&args, options.clone())?;
        }
        self.run_ok_with(&[&gd, &wt, "write-tree"], options)
    }

    /// Write the files of `rev` into `work_tree`, overwriting existing ones.
    pub fn checkout_tree_into(
        &self,
        index_file: &Path,
        rev: &str,
        work_tree: &Path,
    ) -> Result<(), GitgovError> {
        std::fs::create_dir_all(work_tree)?;
        let git_dir = self.git_dir()?;
        let gd = format!("--git-dir={}", git_dir.display());
        let wt = format!("--work-tree={}", work_tree.display());
        let options = self.plumbing_options(index_file, work_tree);
        self.run_ok_with(&[&gd, &wt, "read-tree", rev], options.clone())?;
        self.run_ok_with(&[&gd, &wt, "checkout-index", "-a", "-f"], options)?;
        Ok(())
    }
}

fn classify_remote_failure(op: &str, output: &GitOutput) -> GitgovError {
    let stderr = output.stderr.trim();
    let lowered = stderr.to_lowercase();
    let transient = [
        "could not read from remote",
        "unable to access",
        "connection",
        "timed out",
        "early eof",
        "temporary failure",
        "could not resolve host",
    ];
    if transient.iter().any(|needle| lowered.contains(needle)) {
        GitgovError::TransientIo(format!("git {}: {}", op, stderr))
    } else {
        GitgovError::Git(format!("git {} failed: {}", op, stderr))
    }
}

pub fn parse_name_status(out: &str) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = out
        .lines()
        .filter_map(|line| {
            let (code, file) = line.split_once('\t')?;
            let status = match code.chars().next()? {
                'A' => ChangeStatus::Added,
                'D' => ChangeStatus::Deleted,
                _ => ChangeStatus::Modified,
            };
            Some(FileChange {
                status,
                file: file.to_string(),
            })
        })
        .collect();
    changes.sort_by(|a, b| a.file.cmp(&b.file));
    changes
}
