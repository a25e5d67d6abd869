use super::{ChangedFile, FileStatus, Probe, VersionControl};
use crate::util::sha256_hex;
use git2::{Delta, Diff, DiffOptions, Oid, Patch, Repository};
use std::path::{Path, PathBuf};

/// Paths that belong to the conductor itself and never count as working-tree changes.
const IGNORED_PREFIXES: &[&str] = &[".conductor/", ".conductor"];

/// `git2`-backed version-control collaborator.
///
/// The repository is opened per query so the tracker is `Send + Sync` and a
/// repository that appears or disappears mid-run is handled as "no information".
pub struct GitTracker {
    repo_dir: PathBuf,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            repo_dir: project_dir.to_path_buf(),
        }
    }

    fn open(&self) -> Result<Repository, git2::Error> {
        Repository::discover(&self.repo_dir)
    }

    /// Resolve `base` as a local branch first, then as `origin/<base>`.
    fn resolve_base(repo: &Repository, base: &str) -> Result<Oid, git2::Error> {
        for candidate in [base.to_string(), format!("origin/{}", base)] {
            if let Ok(obj) = repo.revparse_single(&candidate) {
                return Ok(obj.peel_to_commit()?.id());
            }
        }
        Err(git2::Error::from_str(&format!(
            "base branch '{}' not found",
            base
        )))
    }

    fn merge_base_oid(repo: &Repository, base: &str) -> Result<Oid, git2::Error> {
        let head = repo.head()?.peel_to_commit()?.id();
        let base_oid = Self::resolve_base(repo, base)?;
        repo.merge_base(head, base_oid)
    }

    fn workdir_diff<'r>(repo: &'r Repository, base: &str) -> Result<Diff<'r>, git2::Error> {
        let oid = Self::merge_base_oid(repo, base)?;
        let tree = repo.find_commit(oid)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let mut diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;
        diff.find_similar(None)?;
        Ok(diff)
    }

    /// Walk every delta once, producing the file entry and its patch text.
    fn collect_patches(diff: &Diff<'_>) -> Result<Vec<(ChangedFile, String)>, git2::Error> {
        let mut out = Vec::new();

        for idx in 0..diff.deltas().len() {
            let Some(delta) = diff.get_delta(idx) else {
                continue;
            };
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_string_lossy().replace('\\', "/");
            if is_ignored(&path) {
                continue;
            }

            let status = match delta.status() {
                Delta::Added | Delta::Untracked => FileStatus::Added,
                Delta::Modified | Delta::Typechange => FileStatus::Modified,
                Delta::Deleted => FileStatus::Deleted,
                Delta::Renamed | Delta::Copied => FileStatus::Renamed,
                _ => continue,
            };

            let mut lines_added = 0;
            let mut lines_deleted = 0;
            let mut text = String::new();
            if let Some(mut patch) = Patch::from_diff(diff, idx)? {
                let (_, added, deleted) = patch.line_stats()?;
                lines_added = added;
                lines_deleted = deleted;
                let buf = patch.to_buf()?;
                text = String::from_utf8_lossy(&buf).into_owned();
            }

            let fingerprint = sha256_hex(format!("{}\0{:?}\0{}", path, status, text));
            out.push((
                ChangedFile {
                    path,
                    status,
                    lines_added,
                    lines_deleted,
                    fingerprint,
                },
                text,
            ));
        }

        out.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        Ok(out)
    }

    fn changed_with_text(&self, base: &str) -> Result<Vec<(ChangedFile, String)>, git2::Error> {
        let repo = self.open()?;
        let diff = Self::workdir_diff(&repo, base)?;
        Self::collect_patches(&diff)
    }
}

fn is_ignored(path: &str) -> bool {
    IGNORED_PREFIXES
        .iter()
        .any(|prefix| path == *prefix || path.starts_with(prefix))
}

impl VersionControl for GitTracker {
    fn merge_base(&self, base: &str) -> Probe<String> {
        self.open()
            .and_then(|repo| Self::merge_base_oid(&repo, base))
            .map(|oid| oid.to_string())
            .into()
    }

    fn changed_files(&self, base: &str) -> Probe<Vec<ChangedFile>> {
        self.changed_with_text(base)
            .map(|files| files.into_iter().map(|(f, _)| f).collect())
            .into()
    }

    fn diff_text(&self, base: &str) -> Probe<String> {
        self.changed_with_text(base)
            .map(|files| {
                files
                    .into_iter()
                    .map(|(_, text)| text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .into()
    }

    fn head_sha(&self) -> Probe<String> {
        self.open()
            .and_then(|repo| {
                let commit = repo.head()?.peel_to_commit()?;
                Ok(commit.id().to_string())
            })
            .into()
    }

    fn is_branch_merged(&self, branch: &str, base: &str) -> Probe<bool> {
        let result = (|| -> Result<bool, git2::Error> {
            let repo = self.open()?;
            let branch_oid = repo.revparse_single(branch)?.peel_to_commit()?.id();
            let base_oid = Self::resolve_base(&repo, base)?;
            if branch_oid == base_oid {
                return Ok(true);
            }
            repo.graph_descendant_of(base_oid, branch_oid)
        })();
        result.into()
    }

    fn list_worktrees(&self) -> Probe<Vec<PathBuf>> {
        let result = (|| -> Result<Vec<PathBuf>, git2::Error> {
            let mut repo = self.open()?;
            if repo.is_worktree() {
                repo = Repository::open(repo.commondir())?;
            }

            let mut paths = Vec::new();
            if let Some(workdir) = repo.workdir() {
                paths.push(workdir.to_path_buf());
            }
            let names = repo.worktrees()?;
            for name in names.iter().flatten() {
                if let Ok(wt) = repo.find_worktree(name) {
                    paths.push(wt.path().to_path_buf());
                }
            }
            Ok(paths)
        })();
        result.into()
    }
}
