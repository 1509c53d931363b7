//! Existence checks for index paths against the repository tree at a commit.
//!
//! Index paths are relative to the upload root. The checker joins them with
//! the root, collects the parent directory of each, and asks for the
//! children of all those directories in a single lookup.

use std::collections::{BTreeSet, HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;

/// Lists the direct children of directories in the repository tree.
///
/// Keys of the returned map are the requested directories (`""` is the
/// repository root); values are repository-relative paths of their children.
/// Directories that do not exist may be missing from the map.
#[async_trait]
pub trait ChildrenLookup: Send + Sync {
    async fn children(&self, dirnames: &[String]) -> Result<HashMap<String, Vec<String>>>;
}

/// Answers whether a root-relative path exists in the repository tree.
#[derive(Debug, Clone, Default)]
pub struct PathExistenceChecker {
    root: String,
    entries: HashMap<String, HashSet<String>>,
}

impl PathExistenceChecker {
    /// Builds a checker able to answer for every path in `paths`.
    pub async fn load<L>(root: &str, paths: &[String], lookup: &L) -> Result<Self>
    where
        L: ChildrenLookup + ?Sized,
    {
        let root = clean_path(root);
        let dirnames: BTreeSet<String> = paths
            .iter()
            .map(|path| dirname(&join_root(&root, path)).to_string())
            .collect();
        let dirnames: Vec<String> = dirnames.into_iter().collect();

        let children = if dirnames.is_empty() {
            HashMap::new()
        } else {
            lookup.children(&dirnames).await?
        };

        let entries: HashMap<String, HashSet<String>> = children
            .into_iter()
            .map(|(dir, children)| {
                let children: HashSet<String> =
                    children.iter().map(|child| clean_path(child)).collect();
                (clean_path(&dir), children)
            })
            .collect();

        Ok(Self { root, entries })
    }

    /// Whether `path`, relative to the upload root, exists.
    pub fn exists(&self, path: &str) -> bool {
        let full = join_root(&self.root, path);
        self.entries
            .get(dirname(&full))
            .map(|children| children.contains(&full))
            .unwrap_or(false)
    }
}

/// Normalizes a slash-separated relative path: drops empty and `.`
/// segments and resolves `..` lexically.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn join_root(root: &str, path: &str) -> String {
    if root.is_empty() {
        clean_path(path)
    } else {
        clean_path(&format!("{}/{}", root, path))
    }
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StaticTree {
        files: Vec<&'static str>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ChildrenLookup for StaticTree {
        async fn children(&self, dirnames: &[String]) -> Result<HashMap<String, Vec<String>>> {
            self.calls.lock().unwrap().push(dirnames.to_vec());
            let mut out = HashMap::new();
            for dir in dirnames {
                let children: Vec<String> = self
                    .files
                    .iter()
                    .filter(|f| dirname(f) == dir.as_str())
                    .map(|f| f.to_string())
                    .collect();
                if !children.is_empty() {
                    out.insert(dir.clone(), children);
                }
            }
            Ok(out)
        }
    }

    fn tree() -> StaticTree {
        StaticTree {
            files: vec!["README.md", "web/src/main.ts", "web/src/util.ts", "web/package.json"],
            calls: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("./a//b/../c/"), "a/c");
        assert_eq!(clean_path(""), "");
        assert_eq!(clean_path("../x"), "x");
    }

    #[tokio::test]
    async fn test_exists_relative_to_root() {
        let tree = tree();
        let paths = vec![
            "src/main.ts".to_string(),
            "src/missing.ts".to_string(),
            "package.json".to_string(),
            "gen/out.ts".to_string(),
        ];
        let checker = PathExistenceChecker::load("web/", &paths, &tree).await.unwrap();

        assert!(checker.exists("src/main.ts"));
        assert!(checker.exists("./src/main.ts"));
        assert!(checker.exists("package.json"));
        assert!(!checker.exists("src/missing.ts"));
        assert!(!checker.exists("gen/out.ts"));

        let calls = tree.calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "all directories are looked up at once");
        assert_eq!(calls[0], vec!["web", "web/gen", "web/src"]);
    }

    #[tokio::test]
    async fn test_empty_root_uses_repository_root() {
        let tree = tree();
        let paths = vec!["README.md".to_string()];
        let checker = PathExistenceChecker::load("", &paths, &tree).await.unwrap();
        assert!(checker.exists("README.md"));
        assert!(!checker.exists("web/package.json"));
    }

    #[tokio::test]
    async fn test_no_paths_skips_lookup() {
        let tree = tree();
        let checker = PathExistenceChecker::load("", &[], &tree).await.unwrap();
        assert!(!checker.exists("README.md"));
        assert!(tree.calls.lock().unwrap().is_empty());
    }
}
