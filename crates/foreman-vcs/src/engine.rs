use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use crate::interface::{
    is_commit_sha, CherryPickOutcome, CommitInfo, ConflictReport, DiffFile, DiffStatus,
    DiffSummary, MergeOptions, MergeOutcome, MergeStrategy, UncommittedFile, VcsError,
};
use crate::runner::{CommandRunner, ProcessCommandRunner};

const DEFAULT_GIT_BINARY: &str = "git";
const SAFETY_TAG_MESSAGE: &str = "pre-merge safety point";
const FIELD_SEPARATOR: char = '\u{1f}';
const LOG_FORMAT: &str = "%H%x1f%an%x1f%ae%x1f%at%x1f%s";

/// Git-backed worktree and sync engine. Read-only analysis (`merge_base`,
/// `diff`, `check_merge_conflicts`, `commit_list`) never touches the working
/// tree; mutating operations must be serialized per target branch by the
/// caller.
pub struct GitSyncEngine<R: CommandRunner = ProcessCommandRunner> {
    runner: R,
    binary: PathBuf,
}

impl Default for GitSyncEngine<ProcessCommandRunner> {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_GIT_BINARY))
    }
}

impl GitSyncEngine<ProcessCommandRunner> {
    pub fn new(binary: PathBuf) -> Self {
        Self::with_runner(ProcessCommandRunner, binary)
    }
}

impl<R: CommandRunner> GitSyncEngine<R> {
    pub fn with_runner(runner: R, binary: PathBuf) -> Self {
        Self { runner, binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Common ancestor of two refs. Fails when no ancestor exists or the
    /// output is not a full commit identifier.
    pub fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String, VcsError> {
        let output = self.run_git(repo, &Self::merge_base_args(a, b))?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !is_commit_sha(&sha) {
            return Err(VcsError::MalformedOutput(format!(
                "merge-base returned '{sha}'"
            )));
        }
        Ok(sha)
    }

    /// Combined name-status and numstat diff between two refs. Binary-file
    /// markers and malformed counts parse as zero rather than failing.
    pub fn diff(&self, repo: &Path, from: &str, to: &str) -> Result<DiffSummary, VcsError> {
        let name_status = self.run_git(repo, &Self::diff_name_status_args(from, to))?;
        let numstat = self.run_git(repo, &Self::diff_numstat_args(from, to))?;

        let files = parse_name_status(&String::from_utf8_lossy(&name_status.stdout));
        let (additions, deletions) = parse_numstat(&String::from_utf8_lossy(&numstat.stdout));

        Ok(DiffSummary {
            files,
            additions,
            deletions,
        })
    }

    /// Static conflict pre-check: intersects the file sets changed on each
    /// side since the merge base. Never checks out or stages anything, so it
    /// is safe to run while a merge on the same repository is in flight.
    pub fn check_merge_conflicts(
        &self,
        repo: &Path,
        source: &str,
        target: &str,
    ) -> Result<ConflictReport, VcsError> {
        let merge_base = self.merge_base(repo, source, target)?;
        let source_files = self.changed_files_since(repo, &merge_base, source)?;
        let target_files = self.changed_files_since(repo, &merge_base, target)?;

        let target_set: std::collections::HashSet<&str> =
            target_files.iter().map(String::as_str).collect();
        let conflicting_files: Vec<String> = source_files
            .into_iter()
            .filter(|file| target_set.contains(file.as_str()))
            .collect();

        Ok(ConflictReport {
            has_conflicts: !conflicting_files.is_empty(),
            merge_base,
            conflicting_files,
        })
    }

    /// Squash-merges `source` into the checked-out branch and commits the
    /// result. The caller is responsible for verifying a clean tree first.
    /// Returns the new commit.
    pub fn squash_merge(
        &self,
        repo: &Path,
        source: &str,
        message: &str,
    ) -> Result<String, VcsError> {
        self.run_git(repo, &Self::squash_merge_args(source))?;
        self.run_git(repo, &Self::commit_args(message))?;
        self.head_commit(repo)
    }

    /// Applies `start..end` onto the checked-out branch. A conflict is a
    /// result, not an error: the caller decides between manual resolution,
    /// abort, and retry.
    pub fn cherry_pick_range(
        &self,
        repo: &Path,
        start: &str,
        end: &str,
    ) -> Result<CherryPickOutcome, VcsError> {
        match self.run_git(repo, &Self::cherry_pick_args(start, end)) {
            Ok(_) => Ok(CherryPickOutcome {
                success: true,
                conflicting_commit: None,
                conflicting_files: Vec::new(),
            }),
            Err(VcsError::CommandFailed { .. }) => {
                let conflicting_commit = self.head_commit(repo)?;
                let conflicting_files = self.unmerged_files(repo)?;
                Ok(CherryPickOutcome {
                    success: false,
                    conflicting_commit: Some(conflicting_commit),
                    conflicting_files,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Ordered commit metadata for `base..head`, newest first.
    pub fn commit_list(
        &self,
        repo: &Path,
        base: &str,
        head: &str,
    ) -> Result<Vec<CommitInfo>, VcsError> {
        let output = self.run_git(repo, &Self::log_args(base, head))?;
        parse_commit_list(&String::from_utf8_lossy(&output.stdout))
    }

    /// Gate before any mutating operation. Any underlying failure reads as a
    /// dirty tree (fail closed).
    pub fn is_working_tree_clean(&self, repo: &Path) -> bool {
        match self.run_git(repo, &Self::status_porcelain_args(None)) {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Force-creates an annotated tag at `target` so a risky operation can be
    /// rolled back. Re-running re-tags the same name.
    pub fn create_safety_tag(&self, repo: &Path, name: &str, target: &str) -> Result<(), VcsError> {
        self.run_git(repo, &Self::safety_tag_args(name, target))?;
        Ok(())
    }

    /// Working-tree changes from porcelain status, optionally limited to a
    /// pathspec. Filenames with spaces survive parsing.
    pub fn uncommitted_files(
        &self,
        repo: &Path,
        pathspec: Option<&str>,
    ) -> Result<Vec<UncommittedFile>, VcsError> {
        let output = self.run_git(repo, &Self::status_porcelain_args(pathspec))?;
        Ok(parse_porcelain_status(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    /// Merges `source` into the checked-out branch: fast-forward when the
    /// source strictly descends from it, otherwise a real merge or squash per
    /// options. Conflicts abort the in-flight merge and come back as a list
    /// of files rather than a raw tool error.
    pub fn merge_branch(
        &self,
        repo: &Path,
        source: &str,
        options: &MergeOptions,
    ) -> Result<MergeOutcome, VcsError> {
        if options.allow_fast_forward && self.is_ancestor(repo, "HEAD", source)? {
            self.run_git(repo, &Self::merge_ff_only_args(source))?;
            return Ok(MergeOutcome {
                merged: true,
                fast_forwarded: true,
                merge_commit: Some(self.head_commit(repo)?),
                conflicting_files: Vec::new(),
            });
        }

        let message = options
            .message
            .clone()
            .unwrap_or_else(|| format!("Merge branch '{source}'"));
        let attempt = match options.strategy {
            MergeStrategy::Merge => self
                .run_git(repo, &Self::merge_no_ff_args(source, &message))
                .map(|_| ()),
            MergeStrategy::Squash => self
                .run_git(repo, &Self::squash_merge_args(source))
                .and_then(|_| self.run_git(repo, &Self::commit_args(&message)))
                .map(|_| ()),
        };

        match attempt {
            Ok(()) => Ok(MergeOutcome {
                merged: true,
                fast_forwarded: false,
                merge_commit: Some(self.head_commit(repo)?),
                conflicting_files: Vec::new(),
            }),
            Err(error @ VcsError::CommandFailed { .. }) => {
                let conflicting_files = self.unmerged_files(repo)?;
                if conflicting_files.is_empty() {
                    return Err(error);
                }
                // Leave the tree usable for the next queue entry.
                let _ = self.run_git(repo, &Self::merge_abort_args());
                Ok(MergeOutcome {
                    merged: false,
                    fast_forwarded: false,
                    merge_commit: None,
                    conflicting_files,
                })
            }
            Err(error) => Err(error),
        }
    }

    pub fn create_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), VcsError> {
        let args = Self::worktree_add_args(worktree_path, branch, base_branch);
        if let Err(error) = self.run_git(repo, &args) {
            if !is_branch_already_exists_error(&error) {
                return Err(error);
            }

            let _ = self.run_git(repo, &Self::worktree_prune_args());
            let fallback = Self::worktree_add_existing_branch_args(worktree_path, branch);
            self.run_git(repo, &fallback)?;
        }
        Ok(())
    }

    pub fn remove_worktree(
        &self,
        repo: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), VcsError> {
        if repo == worktree_path {
            return Err(VcsError::Configuration(format!(
                "refusing to remove repository root '{}' as a worktree",
                repo.display()
            )));
        }
        self.run_git(repo, &Self::worktree_remove_args(worktree_path, force))?;
        Ok(())
    }

    pub fn prune_worktrees(&self, repo: &Path) -> Result<(), VcsError> {
        self.run_git(repo, &Self::worktree_prune_args())?;
        Ok(())
    }

    pub fn head_commit(&self, repo: &Path) -> Result<String, VcsError> {
        let output = self.run_git(repo, &Self::rev_parse_head_args())?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if !is_commit_sha(&sha) {
            return Err(VcsError::MalformedOutput(format!(
                "rev-parse HEAD returned '{sha}'"
            )));
        }
        Ok(sha)
    }

    /// Probe failures read as "not an ancestor": the fall-through merge
    /// surfaces any real error with full context.
    fn is_ancestor(&self, repo: &Path, ancestor: &str, descendant: &str) -> Result<bool, VcsError> {
        let args = Self::is_ancestor_args(ancestor, descendant);
        let output = self.run_git_raw(repo, &args)?;
        Ok(output.status.success())
    }

    fn changed_files_since(
        &self,
        repo: &Path,
        base: &str,
        branch: &str,
    ) -> Result<Vec<String>, VcsError> {
        let output = self.run_git(repo, &Self::diff_name_only_args(base, branch))?;
        Ok(non_empty_lines(&String::from_utf8_lossy(&output.stdout)))
    }

    fn unmerged_files(&self, repo: &Path) -> Result<Vec<String>, VcsError> {
        let output = self.run_git(repo, &Self::unmerged_files_args())?;
        Ok(non_empty_lines(&String::from_utf8_lossy(&output.stdout)))
    }

    fn run_git_raw(
        &self,
        repo: &Path,
        args: &[OsString],
    ) -> Result<std::process::Output, VcsError> {
        let program = self.binary.to_str().ok_or_else(|| {
            VcsError::Configuration("git binary path is not valid UTF-8".to_owned())
        })?;
        let mut full_args = vec![OsString::from("-C"), repo.as_os_str().to_owned()];
        full_args.extend_from_slice(args);

        self.runner
            .run(program, &full_args)
            .map_err(|error| match error.kind() {
                io::ErrorKind::NotFound => VcsError::Unavailable(format!(
                    "git binary `{}` was not found",
                    self.binary.display()
                )),
                _ => VcsError::Unavailable(format!(
                    "failed to execute `{}`: {error}",
                    self.binary.display()
                )),
            })
    }

    fn run_git(&self, repo: &Path, args: &[OsString]) -> Result<std::process::Output, VcsError> {
        let output = self.run_git_raw(repo, args)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(self.command_failed(args, &output))
    }

    fn command_failed(&self, args: &[OsString], output: &std::process::Output) -> VcsError {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let detail = if !stderr.is_empty() {
            stderr.clone()
        } else if !stdout.is_empty() {
            stdout.clone()
        } else {
            format!("exit status {}", output.status)
        };
        let rendered_args = args
            .iter()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");

        VcsError::CommandFailed {
            command: format!("{} {rendered_args}", self.binary.display()),
            stdout,
            stderr,
            detail,
        }
    }

    pub fn merge_base_args(a: &str, b: &str) -> Vec<OsString> {
        vec![
            OsString::from("merge-base"),
            OsString::from(a),
            OsString::from(b),
        ]
    }

    pub fn diff_name_status_args(from: &str, to: &str) -> Vec<OsString> {
        vec![
            OsString::from("diff"),
            OsString::from("--name-status"),
            OsString::from(format!("{from}..{to}")),
        ]
    }

    pub fn diff_numstat_args(from: &str, to: &str) -> Vec<OsString> {
        vec![
            OsString::from("diff"),
            OsString::from("--numstat"),
            OsString::from(format!("{from}..{to}")),
        ]
    }

    pub fn diff_name_only_args(base: &str, branch: &str) -> Vec<OsString> {
        vec![
            OsString::from("diff"),
            OsString::from("--name-only"),
            OsString::from(format!("{base}..{branch}")),
        ]
    }

    pub fn squash_merge_args(source: &str) -> Vec<OsString> {
        vec![
            OsString::from("merge"),
            OsString::from("--squash"),
            OsString::from(source),
        ]
    }

    pub fn commit_args(message: &str) -> Vec<OsString> {
        vec![
            OsString::from("commit"),
            OsString::from("-m"),
            OsString::from(message),
        ]
    }

    pub fn cherry_pick_args(start: &str, end: &str) -> Vec<OsString> {
        vec![
            OsString::from("cherry-pick"),
            OsString::from(format!("{start}..{end}")),
        ]
    }

    pub fn log_args(base: &str, head: &str) -> Vec<OsString> {
        vec![
            OsString::from("log"),
            OsString::from(format!("--format={LOG_FORMAT}")),
            OsString::from(format!("{base}..{head}")),
        ]
    }

    pub fn status_porcelain_args(pathspec: Option<&str>) -> Vec<OsString> {
        let mut args = vec![OsString::from("status"), OsString::from("--porcelain")];
        if let Some(pathspec) = pathspec {
            args.push(OsString::from("--"));
            args.push(OsString::from(pathspec));
        }
        args
    }

    pub fn safety_tag_args(name: &str, target: &str) -> Vec<OsString> {
        vec![
            OsString::from("tag"),
            OsString::from("-f"),
            OsString::from("-a"),
            OsString::from(name),
            OsString::from("-m"),
            OsString::from(SAFETY_TAG_MESSAGE),
            OsString::from(target),
        ]
    }

    pub fn merge_ff_only_args(source: &str) -> Vec<OsString> {
        vec![
            OsString::from("merge"),
            OsString::from("--ff-only"),
            OsString::from(source),
        ]
    }

    pub fn merge_no_ff_args(source: &str, message: &str) -> Vec<OsString> {
        vec![
            OsString::from("merge"),
            OsString::from("--no-ff"),
            OsString::from("-m"),
            OsString::from(message),
            OsString::from(source),
        ]
    }

    pub fn merge_abort_args() -> Vec<OsString> {
        vec![OsString::from("merge"), OsString::from("--abort")]
    }

    pub fn unmerged_files_args() -> Vec<OsString> {
        vec![
            OsString::from("diff"),
            OsString::from("--name-only"),
            OsString::from("--diff-filter=U"),
        ]
    }

    pub fn rev_parse_head_args() -> Vec<OsString> {
        vec![OsString::from("rev-parse"), OsString::from("HEAD")]
    }

    pub fn is_ancestor_args(ancestor: &str, descendant: &str) -> Vec<OsString> {
        vec![
            OsString::from("merge-base"),
            OsString::from("--is-ancestor"),
            OsString::from(ancestor),
            OsString::from(descendant),
        ]
    }

    pub fn worktree_add_args(
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Vec<OsString> {
        vec![
            OsString::from("worktree"),
            OsString::from("add"),
            OsString::from("-b"),
            OsString::from(branch),
            worktree_path.as_os_str().to_owned(),
            OsString::from(base_branch),
        ]
    }

    pub fn worktree_add_existing_branch_args(
        worktree_path: &Path,
        branch: &str,
    ) -> Vec<OsString> {
        vec![
            OsString::from("worktree"),
            OsString::from("add"),
            worktree_path.as_os_str().to_owned(),
            OsString::from(branch),
        ]
    }

    pub fn worktree_remove_args(worktree_path: &Path, force: bool) -> Vec<OsString> {
        let mut args = vec![OsString::from("worktree"), OsString::from("remove")];
        if force {
            args.push(OsString::from("--force"));
        }
        args.push(worktree_path.as_os_str().to_owned());
        args
    }

    pub fn worktree_prune_args() -> Vec<OsString> {
        vec![OsString::from("worktree"), OsString::from("prune")]
    }
}

fn is_branch_already_exists_error(error: &VcsError) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("branch named") && message.contains("already exists")
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_name_status(output: &str) -> Vec<DiffFile> {
    let mut files = Vec::new();
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let Some(code) = fields.next() else {
            continue;
        };
        // Renames and copies carry two paths; the destination is the one
        // that exists after the diff.
        let path = match fields.clone().count() {
            0 => continue,
            1 => fields.next(),
            _ => fields.last(),
        };
        let Some(path) = path else {
            continue;
        };
        files.push(DiffFile {
            path: path.to_owned(),
            status: DiffStatus::from_code(code),
        });
    }
    files
}

fn parse_numstat(output: &str) -> (u64, u64) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in output.lines() {
        let mut fields = line.split('\t');
        let added = fields.next().unwrap_or("");
        let deleted = fields.next().unwrap_or("");
        additions += added.parse::<u64>().unwrap_or(0);
        deletions += deleted.parse::<u64>().unwrap_or(0);
    }
    (additions, deletions)
}

fn parse_porcelain_status(output: &str) -> Vec<UncommittedFile> {
    let mut files = Vec::new();
    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let status = line[..2].to_owned();
        let mut path = &line[3..];
        // Renames are reported as `XY old -> new`.
        if let Some((_, destination)) = path.split_once(" -> ") {
            path = destination;
        }
        files.push(UncommittedFile {
            status,
            path: path.to_owned(),
        });
    }
    files
}

fn parse_commit_list(output: &str) -> Result<Vec<CommitInfo>, VcsError> {
    let mut commits = Vec::new();
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(5, FIELD_SEPARATOR).collect();
        let [sha, author, email, timestamp, message] = fields[..] else {
            return Err(VcsError::MalformedOutput(format!(
                "log line has {} fields, expected 5",
                fields.len()
            )));
        };
        if !is_commit_sha(sha) {
            return Err(VcsError::InvalidCommit(sha.to_owned()));
        }
        commits.push(CommitInfo {
            sha: sha.to_owned(),
            author: author.to_owned(),
            email: email.to_owned(),
            timestamp: timestamp.parse().unwrap_or(0),
            message: message.to_owned(),
        });
    }
    Ok(commits)
}
