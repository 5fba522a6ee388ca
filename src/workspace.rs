//! Isolated working areas for agents.
//!
//! Every active task gets its own git worktree on its own branch so agents
//! never trample each other's changes. `GitWorkspaces` implements the seam
//! with libgit2: branch creation, worktree add/prune, status checks, and
//! commit-all.

use async_trait::async_trait;
use git2::{Repository, Signature, StatusOptions, WorktreeAddOptions, WorktreePruneOptions};
use std::path::{Path, PathBuf};

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::{hlog, hlog_debug};

/// A provisioned working area.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
}

/// Snapshot of a workspace's git status.
#[derive(Debug, Clone)]
pub struct WorkspaceStatus {
    pub clean: bool,
    pub changed_files: Vec<String>,
}

/// Workspace lifecycle seam.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Provision an isolated working area and branch for a task.
    async fn create(&self, task: &Task) -> Result<Workspace>;

    /// Tear down a task's working area and its bookkeeping.
    async fn remove(&self, task: &Task) -> Result<()>;

    /// Report whether the working area has uncommitted changes.
    async fn status(&self, task: &Task) -> Result<WorkspaceStatus>;

    /// Commit all outstanding changes. Returns the commit hash, or `None`
    /// when the working area was already clean.
    async fn commit(&self, task: &Task, message: &str) -> Result<Option<String>>;
}

/// Branch-per-task worktrees under a parent repository.
pub struct GitWorkspaces {
    repo_root: PathBuf,
    workspaces_dir: PathBuf,
    branch_prefix: String,
}

impl GitWorkspaces {
    pub fn new(repo_root: &Path, workspaces_dir: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            workspaces_dir: workspaces_dir.to_path_buf(),
            branch_prefix: "hive".to_string(),
        }
    }

    /// Worktree and branch names derived from the task. The short id suffix
    /// keeps same-named tasks from colliding.
    fn workspace_name(task: &Task) -> String {
        let slug: String = task
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("{}-{}", slug.trim_matches('-'), task.id.short())
    }

    fn branch_name(&self, task: &Task) -> String {
        format!("{}/{}", self.branch_prefix, Self::workspace_name(task))
    }

    fn workspace_path(&self, task: &Task) -> PathBuf {
        self.workspaces_dir.join(Self::workspace_name(task))
    }

    fn open_repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_root)?)
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("hive", "hive@localhost")?),
        }
    }
}

#[async_trait]
impl WorkspaceManager for GitWorkspaces {
    async fn create(&self, task: &Task) -> Result<Workspace> {
        let repo = self.open_repo()?;
        let name = Self::workspace_name(task);
        let branch_name = self.branch_name(task);
        let path = self.workspace_path(task);

        if path.exists() {
            return Err(Error::Validation(format!(
                "workspace path already exists: {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(&self.workspaces_dir)?;

        // Branch off the current HEAD, reusing the branch when a previous
        // run already created it.
        let head_commit = repo.head()?.peel_to_commit()?;
        let branch = match repo.find_branch(&branch_name, git2::BranchType::Local) {
            Ok(existing) => existing,
            Err(_) => repo.branch(&branch_name, &head_commit, false)?,
        };

        let reference = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&name, &path, Some(&opts))?;

        hlog!("Created workspace {} on {}", path.display(), branch_name);
        Ok(Workspace {
            path,
            branch: branch_name,
        })
    }

    async fn remove(&self, task: &Task) -> Result<()> {
        let repo = self.open_repo()?;
        let name = Self::workspace_name(task);

        if let Ok(worktree) = repo.find_worktree(&name) {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            worktree.prune(Some(&mut opts))?;
        }

        // Prune leaves the checkout directory and the admin dir behind in
        // some libgit2 versions; clear both so the name can be reused.
        let path = self.workspace_path(task);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        let admin_dir = self.repo_root.join(".git").join("worktrees").join(&name);
        if admin_dir.exists() {
            std::fs::remove_dir_all(&admin_dir)?;
        }

        hlog_debug!("Removed workspace {}", name);
        Ok(())
    }

    async fn status(&self, task: &Task) -> Result<WorkspaceStatus> {
        let path = self.workspace_path(task);
        let repo = Repository::open(&path)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo.statuses(Some(&mut opts))?;

        let changed_files: Vec<String> = statuses
            .iter()
            .filter_map(|entry| entry.path().map(String::from))
            .collect();
        Ok(WorkspaceStatus {
            clean: changed_files.is_empty(),
            changed_files,
        })
    }

    async fn commit(&self, task: &Task, message: &str) -> Result<Option<String>> {
        let path = self.workspace_path(task);
        let repo = Repository::open(&path)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        if repo.statuses(Some(&mut opts))?.is_empty() {
            return Ok(None);
        }

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let signature = Self::signature(&repo)?;
        let parent = repo.head()?.peel_to_commit()?;
        let oid = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;

        hlog_debug!("Committed {} in {}", oid, path.display());
        Ok(Some(oid.to_string()))
    }
}
