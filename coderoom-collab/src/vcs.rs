//! Version-control integration: commit a room snapshot and push it.
//!
//! ```text
//! snapshot dir ──► [.git absent?] ─yes─► git init + remote add origin
//!                        │ no
//!                        ▼
//!                  git remote set-url origin
//!                        │
//!                        ▼
//!        git add -A ─► [changes?] ─yes─► git commit -m
//!                        │ no                   │
//!                        ▼                      ▼
//!                  git push origin HEAD:<branch>
//!                        │
//!                        ▼
//!                  git log -1  ──► CommitOutcome { short hash, author }
//! ```
//!
//! An unchanged snapshot still pushes and reports the current `HEAD`.
//!
//! [`GitCli`] drives the `git` executable with `tokio::process`, so a push
//! in flight never blocks a runtime worker, and the child is killed if
//! the surrounding future is dropped by a timeout.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::persistence::PersistError;
use crate::room::VcsConfig;

/// Length of the abbreviated hash reported to clients.
pub const SHORT_HASH_LEN: usize = 7;

/// Result of a successful commit and push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub short_hash: String,
    pub author_name: String,
}

/// Errors surfaced to the requester as `commit-error`.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("GitHub not configured for this room")]
    NotConfigured,
    #[error("Failed to run git {step}: {reason}")]
    Spawn { step: &'static str, reason: String },
    #[error("git {step} failed: {stderr}")]
    Command { step: &'static str, stderr: String },
    #[error("Unexpected git output: {0:?}")]
    UnexpectedOutput(String),
    #[error("Commit timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Author identity passed to `git commit` via `-c user.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// A remote the coordinator can publish room snapshots to.
#[async_trait]
pub trait VcsRemote: Send + Sync {
    /// Stage everything in `dir`, commit with `message`, and push.
    async fn commit_and_push(
        &self,
        dir: &Path,
        message: &str,
        config: &VcsConfig,
    ) -> Result<CommitOutcome, VcsError>;
}

/// [`VcsRemote`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    /// Host name (`github.com`) or a full base URL such as `file:///srv/git`.
    host: String,
    identity: Option<CommitIdentity>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
            host: "github.com".to_string(),
            identity: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_identity(mut self, identity: Option<CommitIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// URL registered as `origin`.
    ///
    /// For a bare host the token is embedded as HTTPS credentials. A host
    /// given with a scheme is used as a base URL without credentials.
    pub fn remote_url(&self, config: &VcsConfig) -> String {
        let base = self.host.trim_end_matches('/');
        if base.contains("://") {
            return format!("{base}/{}/{}.git", config.owner, config.repo);
        }
        match &config.credential_token {
            Some(token) => format!("https://{token}@{base}/{}/{}.git", config.owner, config.repo),
            None => format!("https://{base}/{}/{}.git", config.owner, config.repo),
        }
    }

    async fn git(
        &self,
        dir: &Path,
        step: &'static str,
        args: &[&str],
        secret: Option<&str>,
    ) -> Result<String, VcsError> {
        let mut cmd = Command::new(&self.program);
        if let Some(identity) = &self.identity {
            cmd.arg("-c")
                .arg(format!("user.name={}", identity.name))
                .arg("-c")
                .arg(format!("user.email={}", identity.email));
        }
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        log::debug!("git {step} in {}", dir.display());
        let output = cmd.output().await.map_err(|e| VcsError::Spawn {
            step,
            reason: e.to_string(),
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        // `git commit` reports "nothing to commit" on stdout.
        let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if detail.is_empty() {
            detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        Err(VcsError::Command {
            step,
            stderr: redact(&detail, secret),
        })
    }
}

#[async_trait]
impl VcsRemote for GitCli {
    async fn commit_and_push(
        &self,
        dir: &Path,
        message: &str,
        config: &VcsConfig,
    ) -> Result<CommitOutcome, VcsError> {
        let url = self.remote_url(config);
        let secret = config.credential_token.as_deref();

        if dir.join(".git").exists() {
            // A later github-connect may point the room somewhere else.
            if self
                .git(dir, "remote set-url", &["remote", "set-url", "origin", &url], secret)
                .await
                .is_err()
            {
                self.git(dir, "remote add", &["remote", "add", "origin", &url], secret)
                    .await?;
            }
        } else {
            self.git(dir, "init", &["init"], secret).await?;
            self.git(dir, "remote add", &["remote", "add", "origin", &url], secret)
                .await?;
        }

        self.git(dir, "add", &["add", "-A"], secret).await?;
        let status = self
            .git(dir, "status", &["status", "--porcelain"], secret)
            .await?;
        if status.trim().is_empty() {
            log::info!("Nothing to commit in {}, pushing current HEAD", dir.display());
        } else {
            self.git(dir, "commit", &["commit", "-m", message], secret).await?;
        }

        let refspec = format!("HEAD:refs/heads/{}", config.branch);
        self.git(dir, "push", &["push", "origin", &refspec], secret).await?;

        let log = self
            .git(dir, "log", &["log", "-1", "--format=%H%n%an"], secret)
            .await?;
        parse_log(&log)
    }
}

/// Parse `%H%n%an` output of `git log -1`.
fn parse_log(output: &str) -> Result<CommitOutcome, VcsError> {
    let mut lines = output.lines();
    let hash = lines.next().map(str::trim).unwrap_or_default();
    let author = lines.next().map(str::trim).unwrap_or_default();
    if hash.len() < SHORT_HASH_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(VcsError::UnexpectedOutput(output.to_string()));
    }
    Ok(CommitOutcome {
        short_hash: hash[..SHORT_HASH_LEN].to_string(),
        author_name: author.to_string(),
    })
}

/// Strip a credential from text that may be shown to users.
pub fn redact(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(secret) if !secret.is_empty() => text.replace(secret, "***"),
        _ => text.to_string(),
    }
}
