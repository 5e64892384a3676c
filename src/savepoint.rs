//! Recovery points around the Migration phase.
//!
//! A savepoint is a commit of the full working tree (tracked and untracked,
//! respecting ignore rules) that is never placed on HEAD. It is referenced by
//! the branch `savepoint/<name>`, so it survives process restarts and shows up
//! in ordinary git tooling. The checked-out branch, HEAD and the on-disk index
//! are left alone by `create`.
//!
//! These types only provide mechanism. When to create, restore or delete is
//! decided by the orchestrator.

use crate::errors::SavepointError;
use crate::store::RepoSavepoint;
use git2::build::CheckoutBuilder;
use git2::{BranchType, Commit, IndexAddOption, Oid, Reference, Repository, ResetType, Signature};
use std::path::{Path, PathBuf};

const BRANCH_PREFIX: &str = "savepoint/";
const HEAD_TRAILER: &str = "Savepoint-Head: ";
const DETACHED: &str = "detached";

/// A recovery point in one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    pub created_at_commit: String,
}

pub struct SavepointManager {
    repo: Repository,
    path: PathBuf,
}

impl SavepointManager {
    pub fn open(path: &Path) -> Result<Self, SavepointError> {
        let repo = Repository::open(path).map_err(|source| SavepointError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
        })
    }

    fn branch_name(name: &str) -> String {
        format!("{BRANCH_PREFIX}{name}")
    }

    fn validate_name(name: &str) -> Result<(), SavepointError> {
        let full = format!("refs/heads/{}", Self::branch_name(name));
        if name.trim().is_empty() || !Reference::is_valid_name(&full) {
            return Err(SavepointError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Result<Option<Commit<'_>>, SavepointError> {
        match self
            .repo
            .find_branch(&Self::branch_name(name), BranchType::Local)
        {
            Ok(branch) => branch
                .get()
                .peel_to_commit()
                .map(Some)
                .map_err(|source| SavepointError::Git {
                    op: "resolve savepoint",
                    source,
                }),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(source) => Err(SavepointError::Git {
                op: "find savepoint",
                source,
            }),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, SavepointError> {
        Ok(self.find(name)?.is_some())
    }

    /// Names of all savepoints in this repository.
    pub fn list(&self) -> Result<Vec<String>, SavepointError> {
        let branches = self
            .repo
            .branches(Some(BranchType::Local))
            .map_err(|source| SavepointError::Git {
                op: "list branches",
                source,
            })?;
        let mut names = Vec::new();
        for entry in branches {
            let (branch, _) = entry.map_err(|source| SavepointError::Git {
                op: "list branches",
                source,
            })?;
            if let Ok(Some(branch_name)) = branch.name()
                && let Some(name) = branch_name.strip_prefix(BRANCH_PREFIX)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Snapshot the working tree into an in-memory index and write its tree.
    ///
    /// The on-disk index is re-read afterwards so the user's staging area is
    /// not disturbed.
    fn snapshot_tree(&self) -> Result<Oid, SavepointError> {
        let uncommittable = |reason: String| SavepointError::Uncommittable {
            path: self.path.clone(),
            reason,
        };

        if self.repo.is_bare() {
            return Err(uncommittable("repository has no working tree".to_string()));
        }

        let mut index = self
            .repo
            .index()
            .map_err(|e| uncommittable(e.message().to_string()))?;
        index.read(true).map_err(|source| SavepointError::Git {
            op: "read index",
            source,
        })?;
        if index.has_conflicts() {
            return Err(uncommittable("index has unresolved conflicts".to_string()));
        }

        let staged = index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .and_then(|_| index.update_all(["*"].iter(), None))
            .and_then(|_| index.write_tree());
        let reloaded = index.read(true);

        let tree_id = staged.map_err(|e| uncommittable(e.message().to_string()))?;
        reloaded.map_err(|source| SavepointError::Git {
            op: "reload index",
            source,
        })?;
        Ok(tree_id)
    }

    fn head_commit(&self) -> Option<Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    fn head_target(&self) -> Result<String, SavepointError> {
        let head = self
            .repo
            .find_reference("HEAD")
            .map_err(|source| SavepointError::Git {
                op: "read HEAD",
                source,
            })?;
        Ok(head
            .symbolic_target()
            .map(str::to_string)
            .unwrap_or_else(|| DETACHED.to_string()))
    }

    /// Record the current working tree under `name`.
    pub fn create(&self, name: &str) -> Result<Savepoint, SavepointError> {
        Self::validate_name(name)?;
        if self.exists(name)? {
            return Err(SavepointError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let tree_id = self.snapshot_tree()?;
        let git = |op: &'static str| move |source| SavepointError::Git { op, source };

        let tree = self.repo.find_tree(tree_id).map_err(git("find tree"))?;
        let sig = Signature::now("shift", "shift@localhost").map_err(git("signature"))?;
        let message = format!(
            "[shift] savepoint {}\n\n{}{}",
            name,
            HEAD_TRAILER,
            self.head_target()?
        );

        let parent = self.head_commit();
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let commit_id = self
            .repo
            .commit(None, &sig, &sig, &message, &tree, &parents)
            .map_err(git("commit snapshot"))?;
        let commit = self
            .repo
            .find_commit(commit_id)
            .map_err(git("find snapshot"))?;

        self.repo
            .branch(&Self::branch_name(name), &commit, false)
            .map_err(|e| {
                if e.code() == git2::ErrorCode::Exists {
                    SavepointError::AlreadyExists {
                        name: name.to_string(),
                    }
                } else {
                    SavepointError::Git {
                        op: "create savepoint branch",
                        source: e,
                    }
                }
            })?;

        Ok(Savepoint {
            name: name.to_string(),
            created_at_commit: commit_id.to_string(),
        })
    }

    /// Restore the working tree, index and HEAD to the state at `create(name)`.
    ///
    /// Files created since are removed; ignored files are left alone. The
    /// savepoint itself is kept.
    pub fn rollback(&self, name: &str) -> Result<(), SavepointError> {
        let snapshot = self.find(name)?.ok_or_else(|| SavepointError::NotFound {
            name: name.to_string(),
        })?;
        let git = |op: &'static str| move |source| SavepointError::Git { op, source };

        let head_target = snapshot
            .message()
            .and_then(|m| m.lines().find_map(|l| l.strip_prefix(HEAD_TRAILER)))
            .unwrap_or(DETACHED)
            .to_string();
        let parent = if snapshot.parent_count() > 0 {
            Some(snapshot.parent(0).map_err(git("read snapshot parent"))?)
        } else {
            None
        };

        match (&parent, head_target.as_str()) {
            (Some(parent), DETACHED) => self
                .repo
                .set_head_detached(parent.id())
                .map_err(git("restore HEAD"))?,
            (_, target) if target != DETACHED => {
                self.repo.set_head(target).map_err(git("restore HEAD"))?
            }
            _ => {}
        }

        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        self.repo
            .checkout_tree(snapshot.as_object(), Some(&mut checkout))
            .map_err(git("restore working tree"))?;

        match parent {
            Some(parent) => {
                self.repo
                    .reset(parent.as_object(), ResetType::Mixed, None)
                    .map_err(git("reset to pre-savepoint commit"))?;
            }
            None => {
                // Unborn before the savepoint: drop anything committed since.
                if let Ok(mut branch) = self.repo.find_reference(&head_target) {
                    branch.delete().map_err(git("reset unborn branch"))?;
                }
                let mut index = self.repo.index().map_err(git("open index"))?;
                index.clear().map_err(git("clear index"))?;
                index.write().map_err(git("write index"))?;
            }
        }
        Ok(())
    }

    /// Remove the recovery point without touching the working tree.
    pub fn delete(&self, name: &str) -> Result<(), SavepointError> {
        let mut branch = match self
            .repo
            .find_branch(&Self::branch_name(name), BranchType::Local)
        {
            Ok(branch) => branch,
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                return Err(SavepointError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(source) => {
                return Err(SavepointError::Git {
                    op: "find savepoint",
                    source,
                });
            }
        };
        branch.delete().map_err(|source| SavepointError::Git {
            op: "delete savepoint",
            source,
        })
    }

    /// Content hash of the present working tree.
    pub fn current_marker(&self) -> Result<String, SavepointError> {
        Ok(self.snapshot_tree()?.to_string())
    }
}

/// The same named savepoint across every configured repository.
pub struct SavepointSet {
    repos: Vec<(String, PathBuf)>,
}

impl SavepointSet {
    pub fn new(repos: Vec<(String, PathBuf)>) -> Self {
        Self { repos }
    }

    fn open(repo: &str, path: &Path) -> Result<SavepointManager, SavepointError> {
        SavepointManager::open(path).map_err(|e| SavepointError::in_repo(repo, e))
    }

    /// First name derived from `base` that is free in every repository and
    /// not in `taken`.
    pub fn unique_name(&self, base: &str, taken: &[String]) -> Result<String, SavepointError> {
        let mut candidate = base.to_string();
        let mut attempt = 0;
        loop {
            let mut free = !taken.contains(&candidate);
            for (repo, path) in &self.repos {
                if !free {
                    break;
                }
                let manager = Self::open(repo, path)?;
                free = !manager
                    .exists(&candidate)
                    .map_err(|e| SavepointError::in_repo(repo, e))?;
            }
            if free {
                return Ok(candidate);
            }
            attempt += 1;
            candidate = format!("{base}-retry-{attempt}");
        }
    }

    /// Create `name` in every repository. If any repository fails, the
    /// savepoints already created under `name` are deleted again.
    pub fn create(&self, name: &str) -> Result<Vec<RepoSavepoint>, SavepointError> {
        let mut created: Vec<RepoSavepoint> = Vec::new();
        for (repo, path) in &self.repos {
            let result = Self::open(repo, path).and_then(|m| {
                m.create(name)
                    .map_err(|e| SavepointError::in_repo(repo, e))
            });
            match result {
                Ok(savepoint) => created.push(RepoSavepoint {
                    repo: repo.clone(),
                    created_at_commit: savepoint.created_at_commit,
                }),
                Err(err) => {
                    for done in &created {
                        if let Some((_, path)) = self.repos.iter().find(|(r, _)| *r == done.repo)
                            && let Ok(manager) = SavepointManager::open(path)
                            && let Err(cleanup) = manager.delete(name)
                        {
                            tracing::warn!(repo = %done.repo, savepoint = name, error = %cleanup, "Failed to clean up partial savepoint");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(created)
    }

    /// Roll back every repository. All repositories are attempted; the first
    /// failure is returned.
    pub fn rollback(&self, name: &str) -> Result<(), SavepointError> {
        self.for_each(name, |m| m.rollback(name))
    }

    pub fn delete(&self, name: &str) -> Result<(), SavepointError> {
        self.for_each(name, |m| m.delete(name))
    }

    fn for_each(
        &self,
        name: &str,
        op: impl Fn(&SavepointManager) -> Result<(), SavepointError>,
    ) -> Result<(), SavepointError> {
        let mut first_err = None;
        for (repo, path) in &self.repos {
            let result = Self::open(repo, path)
                .and_then(|m| op(&m).map_err(|e| SavepointError::in_repo(repo, e)));
            if let Err(err) = result {
                tracing::error!(repo = %repo, savepoint = name, error = %err, "Savepoint operation failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        repo
    }

    fn commit_file(repo: &Repository, name: &str, content: &str) {
        let root = repo.workdir().unwrap().to_path_buf();
        fs::write(root.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "commit", &tree, &parents)
            .unwrap();
    }

    fn setup() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        commit_file(&repo, "users.js", "fetch('/api/v1/users')\n");
        (dir, repo)
    }

    #[test]
    fn test_create_then_rollback_is_noop() {
        let (dir, _repo) = setup();
        fs::write(dir.path().join("notes.txt"), "untracked before").unwrap();
        let manager = SavepointManager::open(dir.path()).unwrap();

        let before = manager.current_marker().unwrap();
        manager.create("pre-migration-1").unwrap();
        manager.rollback("pre-migration-1").unwrap();

        assert_eq!(manager.current_marker().unwrap(), before);
        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "untracked before"
        );
    }

    #[test]
    fn test_rollback_discards_changes_and_commits() {
        let (dir, repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        let head_before = repo.head().unwrap().peel_to_commit().unwrap().id();
        let marker = manager.current_marker().unwrap();

        manager.create("pre-migration-2").unwrap();

        // Migration edits, commits, and leaves stray files.
        commit_file(&repo, "users.js", "graphql(`query { users { id } }`)\n");
        fs::write(dir.path().join("generated.js"), "new file").unwrap();
        fs::write(dir.path().join("users.js"), "half applied").unwrap();
        assert_ne!(manager.current_marker().unwrap(), marker);

        manager.rollback("pre-migration-2").unwrap();

        assert_eq!(manager.current_marker().unwrap(), marker);
        assert_eq!(
            fs::read_to_string(dir.path().join("users.js")).unwrap(),
            "fetch('/api/v1/users')\n"
        );
        assert!(!dir.path().join("generated.js").exists());
        assert_eq!(
            repo.head().unwrap().peel_to_commit().unwrap().id(),
            head_before
        );
    }

    #[test]
    fn test_create_does_not_move_head_or_index() {
        let (dir, repo) = setup();
        fs::write(dir.path().join("draft.js"), "wip").unwrap();
        let head_before = repo.head().unwrap().peel_to_commit().unwrap().id();
        let manager = SavepointManager::open(dir.path()).unwrap();
        manager.create("s").unwrap();

        assert_eq!(
            repo.head().unwrap().peel_to_commit().unwrap().id(),
            head_before
        );
        let mut index = repo.index().unwrap();
        index.read(true).unwrap();
        assert!(index.get_path(Path::new("draft.js"), 0).is_none());
    }

    #[test]
    fn test_create_rejects_duplicate_name() {
        let (dir, _repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        manager.create("s").unwrap();
        let err = manager.create("s").unwrap_err();
        assert!(matches!(err, SavepointError::AlreadyExists { .. }));
    }

    #[test]
    fn test_markers_differ_after_change() {
        let (dir, _repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        let first = manager.current_marker().unwrap();
        fs::write(dir.path().join("users.js"), "changed").unwrap();
        let second = manager.current_marker().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_rollback_unknown_name_is_not_found() {
        let (dir, _repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        let err = manager.rollback("missing").unwrap_err();
        assert!(matches!(err, SavepointError::NotFound { .. }));
        let err = manager.delete("missing").unwrap_err();
        assert!(matches!(err, SavepointError::NotFound { .. }));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let (dir, _repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        let err = manager.create("bad..name").unwrap_err();
        assert!(matches!(err, SavepointError::InvalidName { .. }));
    }

    #[test]
    fn test_delete_keeps_working_tree() {
        let (dir, _repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        manager.create("s").unwrap();
        fs::write(dir.path().join("users.js"), "migrated").unwrap();
        manager.delete("s").unwrap();
        assert!(!manager.exists("s").unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("users.js")).unwrap(),
            "migrated"
        );
    }

    #[test]
    fn test_unborn_repo_roundtrip() {
        let dir = tempdir().unwrap();
        let repo = init_repo(dir.path());
        fs::write(dir.path().join("a.js"), "a").unwrap();
        let manager = SavepointManager::open(dir.path()).unwrap();
        let marker = manager.current_marker().unwrap();

        manager.create("s").unwrap();
        fs::write(dir.path().join("a.js"), "changed").unwrap();
        fs::write(dir.path().join("b.js"), "b").unwrap();
        manager.rollback("s").unwrap();

        assert_eq!(manager.current_marker().unwrap(), marker);
        assert!(repo.head().is_err());
        assert!(!dir.path().join("b.js").exists());
    }

    #[test]
    fn test_bare_repo_is_uncommittable() {
        let dir = tempdir().unwrap();
        Repository::init_bare(dir.path()).unwrap();
        let manager = SavepointManager::open(dir.path()).unwrap();
        let err = manager.create("s").unwrap_err();
        assert!(matches!(err, SavepointError::Uncommittable { .. }));
    }

    #[test]
    fn test_list_returns_savepoint_names() {
        let (dir, _repo) = setup();
        let manager = SavepointManager::open(dir.path()).unwrap();
        manager.create("b").unwrap();
        manager.create("a").unwrap();
        assert_eq!(manager.list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_set_create_cleans_up_on_partial_failure() {
        let good = tempdir().unwrap();
        let good_repo = init_repo(good.path());
        commit_file(&good_repo, "a.js", "a");
        let missing = tempdir().unwrap();

        let set = SavepointSet::new(vec![
            ("web".to_string(), good.path().to_path_buf()),
            ("api".to_string(), missing.path().join("nope")),
        ]);
        let err = set.create("pre-migration-x").unwrap_err();
        assert!(matches!(err, SavepointError::InRepo { ref repo, .. } if repo == "api"));

        let manager = SavepointManager::open(good.path()).unwrap();
        assert!(!manager.exists("pre-migration-x").unwrap());
    }

    #[test]
    fn test_set_unique_name_skips_existing() {
        let (dir, _repo) = setup();
        let set = SavepointSet::new(vec![("web".to_string(), dir.path().to_path_buf())]);
        set.create("pre-migration-r1").unwrap();
        let name = set
            .unique_name("pre-migration-r1", &["pre-migration-r1-retry-1".to_string()])
            .unwrap();
        assert_eq!(name, "pre-migration-r1-retry-2");
    }
}
