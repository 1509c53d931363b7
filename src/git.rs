//! Source control backed by local git clones.
//!
//! Each repository is expected at `<git.repos_root>/<repository name>`,
//! either bare or with a work tree. A repository whose directory does not
//! exist yet is reported as still cloning, so its uploads are requeued
//! rather than failed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use scip_ingest_core::error::RevisionError;
use scip_ingest_core::models::Repository;
use scip_ingest_core::store::{RefDescription, RefKind, SourceControl};

pub struct GitSourceControl {
    repos_root: PathBuf,
}

impl GitSourceControl {
    pub fn new(repos_root: impl Into<PathBuf>) -> Self {
        Self {
            repos_root: repos_root.into(),
        }
    }

    fn repo_dir(&self, repository: &Repository) -> PathBuf {
        self.repos_root.join(&repository.name)
    }

    async fn commit_exists(&self, dir: &Path, commit: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{}^{{commit}}", commit))
            .current_dir(dir)
            .output()
            .await
            .context("Failed to run git rev-parse")?;
        Ok(output.status.success())
    }

    async fn default_branch(&self, dir: &Path) -> Result<Option<String>> {
        let output = git(dir, &["symbolic-ref", "--quiet", "HEAD"], true).await?;
        let head = output.trim();
        Ok(head
            .strip_prefix("refs/heads/")
            .map(|branch| branch.to_string()))
    }

    async fn existing_repo_dir(&self, repository: &Repository) -> Result<PathBuf> {
        let dir = self.repo_dir(repository);
        if !dir.is_dir() {
            bail!("No clone of {} at {}", repository.name, dir.display());
        }
        Ok(dir)
    }
}

/// Runs git in `dir` and returns stdout. With `allow_failure`, a non-zero
/// exit yields empty output instead of an error.
async fn git(dir: &Path, args: &[&str], allow_failure: bool) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        if allow_failure {
            return Ok(String::new());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn ref_description(refname: &str, default_branch: Option<&str>) -> Option<RefDescription> {
    if let Some(name) = refname.strip_prefix("refs/heads/") {
        Some(RefDescription {
            name: name.to_string(),
            kind: RefKind::Branch,
            is_default_branch: default_branch == Some(name),
        })
    } else {
        refname.strip_prefix("refs/tags/").map(|name| RefDescription {
            name: name.to_string(),
            kind: RefKind::Tag,
            is_default_branch: false,
        })
    }
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn resolve_revision(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<(), RevisionError> {
        let dir = self.repo_dir(repository);
        if !dir.is_dir() {
            return Err(RevisionError::Cloning {
                repository: repository.name.clone(),
            });
        }
        if !self.commit_exists(&dir, commit).await? {
            return Err(RevisionError::NotFound {
                repository: repository.name.clone(),
                commit: commit.to_string(),
            });
        }
        Ok(())
    }

    async fn commit_date(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let dir = self.existing_repo_dir(repository).await?;
        if !self.commit_exists(&dir, commit).await? {
            return Ok(None);
        }

        let rev = format!("{}^{{commit}}", commit);
        let output = git(&dir, &["show", "-s", "--format=%ct", &rev], false).await?;
        let ts: i64 = output
            .trim()
            .parse()
            .with_context(|| format!("Unexpected commit timestamp: {:?}", output.trim()))?;
        Ok(DateTime::from_timestamp(ts, 0))
    }

    async fn list_directory_children(
        &self,
        repository: &Repository,
        commit: &str,
        dirnames: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        let dir = self.existing_repo_dir(repository).await?;
        let mut children = HashMap::new();

        for dirname in dirnames {
            let mut args = vec!["ls-tree", "--name-only", commit];
            let pathspec = format!("{}/", dirname.trim_end_matches('/'));
            if !dirname.is_empty() {
                args.push("--");
                args.push(&pathspec);
            }
            let output = git(&dir, &args, false).await?;
            let mut entries: Vec<String> = output
                .lines()
                .filter(|line| !line.is_empty())
                .map(|line| line.to_string())
                .collect();
            entries.sort();
            children.insert(dirname.clone(), entries);
        }

        Ok(children)
    }

    async fn ref_descriptions(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Vec<RefDescription>> {
        let dir = self.existing_repo_dir(repository).await?;
        let default_branch = self.default_branch(&dir).await?;
        let points_at = format!("--points-at={}", commit);
        let output = git(
            &dir,
            &[
                "for-each-ref",
                &points_at,
                "--format=%(refname)",
                "refs/heads",
                "refs/tags",
            ],
            false,
        )
        .await?;

        Ok(output
            .lines()
            .filter_map(|line| ref_description(line.trim(), default_branch.as_deref()))
            .collect())
    }

    async fn branches_containing(
        &self,
        repository: &Repository,
        commit: &str,
    ) -> Result<Vec<RefDescription>> {
        let dir = self.existing_repo_dir(repository).await?;
        let default_branch = self.default_branch(&dir).await?;
        let contains = format!("--contains={}", commit);
        let output = git(
            &dir,
            &["for-each-ref", &contains, "--format=%(refname)", "refs/heads"],
            false,
        )
        .await?;

        Ok(output
            .lines()
            .filter_map(|line| ref_description(line.trim(), default_branch.as_deref()))
            .collect())
    }
}
