//! Where a run was started from: the command line and the git checkout

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeStatus {
    Clean,
    Dirty,
}

/// State of the git checkout a run executes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInfo {
    pub remote: String,
    pub branch: String,
    pub commit_id: String,
    pub status: TreeStatus,
}

impl GitInfo {
    /// Describe the checkout containing `dir`
    ///
    /// Returns `None` when git is not installed, when `dir` is outside a
    /// repository or when the repository has no `origin` remote.
    pub fn collect(dir: &Path) -> Option<GitInfo> {
        let remote = git_output(dir, &["config", "--get", "remote.origin.url"])?;
        let branch = git_output(dir, &["branch", "--show-current"])?;
        let commit_id = git_output(dir, &["rev-parse", "HEAD"])?;
        // tracked changes only; untracked files keep the tree clean
        let status = match git(dir, &["diff", "--exit-code", "--quiet"]).status() {
            Ok(status) if status.success() => TreeStatus::Clean,
            Ok(_) => TreeStatus::Dirty,
            Err(err) => {
                tracing::debug!(%err, "git diff failed");
                return None;
            }
        };

        Some(GitInfo {
            remote,
            branch,
            commit_id,
            status,
        })
    }
}

fn git(dir: &Path, args: &[&str]) -> Command {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = git(dir, args).stdout(Stdio::piped()).output().ok()?;
    if !output.status.success() {
        tracing::debug!(?args, status = %output.status, "git query failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Directory holding the running executable
pub fn executable_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let exe = exe.canonicalize().unwrap_or(exe);
    exe.parent().map(Path::to_path_buf)
}

/// Arguments the process was started with, joined by spaces
pub fn command_line() -> String {
    std::env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
