//! Auto-selection of commands from `always` flags, git state, and watch batches.
//!
//! All selection entry points walk the resolved tree in document order, so the
//! returned sequences preserve tree traversal order and contain each command
//! at most once. Selector failures (no repository, unreadable status) are
//! logged and produce empty selections rather than errors.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use git2::{Repository, StatusOptions};
use log::{debug, warn};
use parking_lot::Mutex;
use regex::Regex;

use crate::command::{Command, CommandGroup};

const REGEX_CACHE_CAPACITY: usize = 128;

/// Process-wide LRU of compiled patterns, keyed by pattern text.
struct RegexCache {
    capacity: usize,
    entries: HashMap<String, Regex>,
    order: VecDeque<String>,
}

impl RegexCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get_or_compile(&mut self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(regex) = self.entries.get(pattern) {
            let regex = regex.clone();
            self.touch(pattern);
            return Ok(regex);
        }
        let regex = Regex::new(pattern)?;
        self.entries.insert(pattern.to_string(), regex.clone());
        self.order.push_back(pattern.to_string());
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        Ok(regex)
    }

    fn touch(&mut self, pattern: &str) {
        if let Some(pos) = self.order.iter().position(|p| p == pattern) {
            self.order.remove(pos);
            self.order.push_back(pattern.to_string());
        }
    }
}

static REGEX_CACHE: OnceLock<Mutex<RegexCache>> = OnceLock::new();

/// Compile `pattern` through the process-wide cache.
///
/// # Errors
///
/// Returns the underlying [`regex::Error`] for invalid patterns.
pub(crate) fn cached_regex(pattern: &str) -> Result<Regex, regex::Error> {
    REGEX_CACHE
        .get_or_init(|| Mutex::new(RegexCache::new(REGEX_CACHE_CAPACITY)))
        .lock()
        .get_or_compile(pattern)
}

/// An empty pattern list matches nothing.
fn matches_any(patterns: &[String], text: &str) -> bool {
    patterns.iter().any(|pattern| match cached_regex(pattern) {
        Ok(regex) => regex.is_match(text),
        // Patterns are validated at load time; a miss here means the cache
        // was bypassed, so skip the pattern rather than select wrongly.
        Err(e) => {
            warn!("Skipping invalid pattern `{pattern}`: {e}");
            false
        }
    })
}

/// Resolve symlinks where possible; deleted paths fall back to lexical form.
fn canon(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Commands flagged to run unconditionally, in traversal order.
#[must_use]
pub fn select_all_always(tree: &CommandGroup) -> Vec<&Command> {
    tree.all_commands()
        .into_iter()
        .filter(|cmd| cmd.auto.always)
        .collect()
}

/// Commands whose watched paths intersect the uncommitted changes of the
/// repository containing `cwd`, in traversal order.
///
/// No discoverable repository (or any git failure) yields an empty selection.
#[must_use]
pub fn select_git<'a>(tree: &'a CommandGroup, cwd: &Path) -> Vec<&'a Command> {
    let (repo_root, changes) = match repo_changes(cwd) {
        Ok(found) => found,
        Err(e) => {
            debug!("No git selection from {}: {e}", cwd.display());
            return Vec::new();
        }
    };
    debug!(
        "Found {} changed files in {}",
        changes.len(),
        repo_root.display()
    );

    tree.all_commands()
        .into_iter()
        .filter(|cmd| cmd.auto.git && !cmd.auto.path.is_empty())
        .filter(|cmd| {
            changes
                .iter()
                .any(|change| git_change_matches(cmd, &repo_root, change))
        })
        .collect()
}

/// Commands selected by a debounced batch of changed paths, in traversal
/// order. Paths are canonicalized before matching, so batches with the same
/// set of distinct paths select the same commands.
#[must_use]
pub fn select_watch<'a>(
    tree: &'a CommandGroup,
    batch: &HashSet<PathBuf>,
    cwd: &Path,
) -> Vec<&'a Command> {
    let cwd = canon(cwd);
    let changed: Vec<PathBuf> = batch.iter().map(|path| canon(path)).collect();

    tree.all_commands()
        .into_iter()
        .filter(|cmd| cmd.auto.watch && !cmd.auto.path.is_empty())
        .filter(|cmd| {
            changed
                .iter()
                .any(|path| watch_change_matches(cmd, path, &cwd))
        })
        .collect()
}

/// `always` plus git selection, concatenated in that order and deduplicated.
#[must_use]
pub fn select_on_demand<'a>(tree: &'a CommandGroup, cwd: &Path) -> Vec<&'a Command> {
    let mut selected = select_all_always(tree);
    selected.extend(select_git(tree, cwd));
    dedup_by_id(selected)
}

/// Keep the first occurrence of each command id.
pub(crate) fn dedup_by_id(commands: Vec<&Command>) -> Vec<&Command> {
    let mut seen = HashSet::new();
    commands
        .into_iter()
        .filter(|cmd| seen.insert(cmd.id.clone()))
        .collect()
}

/// Enumerate the working-directory diff against `HEAD` for the repository
/// containing `start`: new, modified, and deleted files, plus both sides of
/// renames. Paths are relative to the repository root.
fn repo_changes(start: &Path) -> Result<(PathBuf, Vec<PathBuf>), git2::Error> {
    let repo = Repository::discover(start)?;
    let repo_root = repo
        .workdir()
        .ok_or_else(|| git2::Error::from_str("repository has no working directory"))?
        .to_path_buf();

    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .renames_head_to_index(true)
        .renames_index_to_workdir(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut changes: Vec<PathBuf> = Vec::new();
    for entry in statuses.iter() {
        if entry.status().is_ignored() {
            continue;
        }
        let mut entry_paths: Vec<PathBuf> = Vec::new();
        for delta in [entry.head_to_index(), entry.index_to_workdir()]
            .into_iter()
            .flatten()
        {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path() {
                    entry_paths.push(path.to_path_buf());
                }
            }
        }
        if entry_paths.is_empty() {
            if let Some(path) = entry.path() {
                entry_paths.push(PathBuf::from(path));
            }
        }
        for path in entry_paths {
            if !changes.contains(&path) {
                changes.push(path);
            }
        }
    }

    Ok((repo_root, changes))
}

/// Prefix test against the command's absolute roots; the regex runs on the
/// repo-relative path text.
fn git_change_matches(cmd: &Command, repo_root: &Path, change: &Path) -> bool {
    let absolute = canon(&repo_root.join(change));
    cmd.auto
        .path
        .iter()
        .any(|root| absolute.starts_with(canon(root)))
        && matches_any(&cmd.auto.regex, &change.to_string_lossy())
}

/// Prefix test against the command's absolute roots; the regex runs on the
/// path relative to the engine cwd where possible.
fn watch_change_matches(cmd: &Command, path: &Path, cwd: &Path) -> bool {
    if !cmd
        .auto
        .path
        .iter()
        .any(|root| path.starts_with(canon(root)))
    {
        return false;
    }
    let relative = path.strip_prefix(cwd).unwrap_or(path);
    matches_any(&cmd.auto.regex, &relative.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Auto;

    fn watch_command(name: &str, paths: Vec<PathBuf>, patterns: Vec<&str>) -> Command {
        Command {
            id: name.to_string(),
            name: name.to_string(),
            cmd: "true".to_string(),
            auto: Auto {
                watch: true,
                path: paths,
                regex: patterns.into_iter().map(String::from).collect(),
                ..Auto::default()
            },
            ..Command::default()
        }
    }

    fn tree_of(commands: Vec<Command>) -> CommandGroup {
        CommandGroup {
            id: "root".to_string(),
            name: "root".to_string(),
            commands,
            ..CommandGroup::default()
        }
    }

    #[test]
    fn always_selection_partitions_on_flag() {
        let mut on = watch_command("on", vec![], vec![]);
        on.auto.always = true;
        let off = watch_command("off", vec![], vec![]);
        let tree = tree_of(vec![on, off]);

        let selected = select_all_always(&tree);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "on");
    }

    #[test]
    fn watch_selects_on_root_and_regex() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/main.rs"), "").unwrap();

        let tree = tree_of(vec![watch_command(
            "test",
            vec![root.join("src")],
            vec![r"\.rs$"],
        )]);

        let batch = HashSet::from([root.join("src/main.rs")]);
        let selected = select_watch(&tree, &batch, &root);
        assert_eq!(selected.len(), 1);

        let miss = HashSet::from([root.join("src/main.txt")]);
        assert!(select_watch(&tree, &miss, &root).is_empty());
    }

    #[test]
    fn watch_requires_some_regex() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let tree = tree_of(vec![watch_command("test", vec![root.clone()], vec![])]);

        let batch = HashSet::from([root.join("src/main.rs")]);
        assert!(select_watch(&tree, &batch, &root).is_empty());
    }

    #[test]
    fn watch_ignores_paths_outside_roots() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let tree = tree_of(vec![watch_command(
            "test",
            vec![root.join("src")],
            vec![r".*"],
        )]);

        let batch = HashSet::from([root.join("docs/readme.md")]);
        assert!(select_watch(&tree, &batch, &root).is_empty());
    }

    #[test]
    fn watch_selection_is_order_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let tree = tree_of(vec![
            watch_command("a", vec![root.clone()], vec![r"\.rs$"]),
            watch_command("b", vec![root.clone()], vec![r"\.toml$"]),
        ]);

        let batch = HashSet::from([root.join("lib.rs"), root.join("Cargo.toml")]);
        let names: Vec<&str> = select_watch(&tree, &batch, &root)
            .iter()
            .map(|cmd| cmd.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn git_selection_without_repository_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut cmd = watch_command("test", vec![root.clone()], vec![r".*"]);
        cmd.auto.git = true;
        let tree = tree_of(vec![cmd]);

        assert!(select_git(&tree, &root).is_empty());
    }

    #[test]
    fn git_selects_commands_matching_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Repository::init(&root).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(root.join("README.md"), "docs").unwrap();

        let mut rust = watch_command("rust", vec![root.join("src")], vec![r"\.rs$"]);
        rust.auto.git = true;
        let mut python = watch_command("python", vec![root.join("src")], vec![r"\.py$"]);
        python.auto.git = true;
        let mut rootless = watch_command("rootless", vec![], vec![r".*"]);
        rootless.auto.git = true;
        let tree = tree_of(vec![rust, python, rootless]);

        let names: Vec<&str> = select_git(&tree, &root)
            .iter()
            .map(|cmd| cmd.name.as_str())
            .collect();
        assert_eq!(names, vec!["rust"]);
    }

    #[test]
    fn on_demand_deduplicates_always_and_git() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Repository::init(&root).unwrap();
        std::fs::write(root.join("lib.rs"), "").unwrap();

        let mut both = watch_command("both", vec![root.clone()], vec![r"\.rs$"]);
        both.auto.git = true;
        both.auto.always = true;
        let tree = tree_of(vec![both]);

        let selected = select_on_demand(&tree, &root);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn regex_cache_reuses_and_rejects() {
        assert!(cached_regex(r"\.rs$").is_ok());
        assert!(cached_regex(r"\.rs$").is_ok());
        assert!(cached_regex("[invalid").is_err());
    }
}
