//! Configuration file handling for Fnug.
//!
//! This module defines the structure of the `.fnug.yaml`/`.fnug.json` document
//! and provides discovery, parsing, and structural validation. The types here
//! mirror the file exactly; inheritance resolution into the runtime tree lives
//! in [`crate::command`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{Command, CommandGroup};

/// Supported configuration file names, in discovery order.
const FILENAMES: [&str; 3] = [".fnug.yaml", ".fnug.yml", ".fnug.json"];

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No config file found in {0} or its parents")]
    NotFound(PathBuf),
    #[error("Unknown working directory: {0}")]
    UnknownWorkingDirectory(#[source] std::io::Error),
    #[error("Unable to parse YAML config file {path}: {source}")]
    Yaml {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("Unable to parse JSON config file {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("Invalid regex pattern `{pattern}`: {source}")]
    Regex {
        source: Box<regex::Error>,
        pattern: String,
    },
    #[error("Duplicate ID in config: {0}")]
    DuplicateId(String),
    #[error("Invalid config: {0}")]
    Validation(String),
}

/// Automation rules as written in the config file.
///
/// Absent fields mean "inherit from the parent group" and stay `None` until
/// inheritance resolution collapses them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigAuto {
    pub watch: Option<bool>,
    pub git: Option<bool>,
    pub always: Option<bool>,
    pub path: Option<Vec<PathBuf>>,
    pub regex: Option<Vec<String>>,
}

/// A single command as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigCommand {
    pub id: Option<String>,
    pub name: String,
    pub cmd: String,
    pub cwd: Option<PathBuf>,
    pub interactive: Option<bool>,
    pub auto: Option<ConfigAuto>,
    pub env: Option<HashMap<String, String>>,
    pub depends_on: Option<Vec<String>>,
    pub scrollback: Option<usize>,
}

/// A group of commands or subgroups as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigCommandGroup {
    pub id: Option<String>,
    pub name: String,
    pub cwd: Option<PathBuf>,
    pub auto: Option<ConfigAuto>,
    pub env: Option<HashMap<String, String>>,
    pub commands: Option<Vec<ConfigCommand>>,
    pub children: Option<Vec<ConfigCommandGroup>>,
}

/// Root document: a version marker plus the root command group.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub fnug_version: String,
    #[serde(flatten)]
    pub root: ConfigCommandGroup,
}

impl Config {
    /// Loads and parses a configuration file, choosing the parser by extension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file cannot be read, or
    /// [`ConfigError::Yaml`]/[`ConfigError::Json`] if parsing fails.
    pub fn from_file(file: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(file)
            .map_err(|_| ConfigError::NotFound(file.to_path_buf()))?;
        let config: Config = if file.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents).map_err(|e| ConfigError::Json {
                source: e,
                path: file.to_path_buf(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Yaml {
                source: e,
                path: file.to_path_buf(),
            })?
        };
        config.check_version();
        Ok(config)
    }

    /// Searches for a configuration file in `start` and its parents.
    ///
    /// At each level the file names are tried in the order `.fnug.yaml`,
    /// `.fnug.yml`, `.fnug.json`; the first match wins.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if no config file exists at or above
    /// `start`.
    pub fn find_config(start: &Path) -> Result<PathBuf, ConfigError> {
        let mut path = start.to_path_buf();
        debug!("Searching for config file in {}", start.display());
        loop {
            for file in &FILENAMES {
                let candidate = path.join(file);
                if candidate.exists() {
                    info!("Found config file: {}", candidate.display());
                    return Ok(candidate);
                }
            }
            if !path.pop() {
                return Err(ConfigError::NotFound(start.to_path_buf()));
            }
        }
    }

    /// Warn when the config's `fnug_version` differs from the crate version.
    /// The field is reserved for future compat checks and never fails a load.
    fn check_version(&self) {
        let crate_version = env!("CARGO_PKG_VERSION");
        if self.fnug_version != crate_version {
            warn!(
                "Config fnug_version '{}' differs from fnug version '{crate_version}'",
                self.fnug_version
            );
        }
    }
}

/// Validate a resolved tree for structural violations: duplicate ids, empty
/// names, empty command strings, and dangling or cyclic `depends_on` entries.
pub(crate) fn validate_tree(root: &CommandGroup) -> Result<(), ConfigError> {
    let mut seen_ids = HashSet::new();
    check_duplicates(root, &mut seen_ids)?;
    check_empty_names(root)?;
    check_empty_commands(root)?;
    validate_dependencies(root)?;
    check_empty_groups(root);
    Ok(())
}

fn check_duplicates(group: &CommandGroup, seen: &mut HashSet<String>) -> Result<(), ConfigError> {
    if !seen.insert(group.id.clone()) {
        return Err(ConfigError::DuplicateId(group.id.clone()));
    }
    for cmd in &group.commands {
        if !seen.insert(cmd.id.clone()) {
            return Err(ConfigError::DuplicateId(cmd.id.clone()));
        }
    }
    for child in &group.children {
        check_duplicates(child, seen)?;
    }
    Ok(())
}

fn check_empty_names(group: &CommandGroup) -> Result<(), ConfigError> {
    if group.name.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "Group with id '{}' has an empty name",
            group.id
        )));
    }
    for cmd in &group.commands {
        if cmd.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Command with id '{}' has an empty name",
                cmd.id
            )));
        }
    }
    for child in &group.children {
        check_empty_names(child)?;
    }
    Ok(())
}

fn check_empty_commands(group: &CommandGroup) -> Result<(), ConfigError> {
    for cmd in &group.commands {
        if cmd.cmd.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Command '{}' has an empty cmd string",
                cmd.name
            )));
        }
    }
    for child in &group.children {
        check_empty_commands(child)?;
    }
    Ok(())
}

/// Validate that every `depends_on` reference resolves and there are no cycles.
fn validate_dependencies(root: &CommandGroup) -> Result<(), ConfigError> {
    let commands = root.all_commands();
    let all_ids: HashSet<&str> = commands.iter().map(|c| c.id.as_str()).collect();

    for cmd in &commands {
        for dep in &cmd.depends_on {
            if !all_ids.contains(dep.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Command '{}' depends on '{}' which does not exist",
                    cmd.name, dep
                )));
            }
        }
    }

    let mut visited = HashSet::new();
    let mut stack = HashSet::new();
    for cmd in &commands {
        if !visited.contains(cmd.id.as_str()) {
            detect_cycle(cmd.id.as_str(), &commands, &mut visited, &mut stack)?;
        }
    }

    Ok(())
}

fn detect_cycle<'a>(
    id: &'a str,
    commands: &[&'a Command],
    visited: &mut HashSet<&'a str>,
    stack: &mut HashSet<&'a str>,
) -> Result<(), ConfigError> {
    visited.insert(id);
    stack.insert(id);

    if let Some(cmd) = commands.iter().find(|c| c.id == id) {
        for dep in &cmd.depends_on {
            let dep_str: &str = dep.as_str();
            if !visited.contains(dep_str) {
                detect_cycle(dep_str, commands, visited, stack)?;
            } else if stack.contains(dep_str) {
                return Err(ConfigError::Validation(format!(
                    "Circular dependency detected involving '{dep}'"
                )));
            }
        }
    }

    stack.remove(id);
    Ok(())
}

fn check_empty_groups(group: &CommandGroup) {
    for child in &group.children {
        if child.commands.is_empty() && child.children.is_empty() {
            warn!("Group '{}' has no commands and no children", child.name);
        }
        check_empty_groups(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_document() {
        let raw = r#"
fnug_version: "0.1.0"
name: root
id: root
auto:
  git: true
  path: ["src"]
  regex: ["\\.rs$"]
commands:
  - name: test
    cmd: cargo test
    interactive: true
children:
  - name: svc
    cwd: ./svc
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.fnug_version, "0.1.0");
        assert_eq!(config.root.name, "root");
        let auto = config.root.auto.unwrap();
        assert_eq!(auto.git, Some(true));
        assert_eq!(auto.watch, None);
        let commands = config.root.commands.unwrap();
        assert_eq!(commands[0].name, "test");
        assert_eq!(commands[0].interactive, Some(true));
        assert_eq!(config.root.children.unwrap()[0].name, "svc");
    }

    #[test]
    fn from_file_parses_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".fnug.json");
        std::fs::write(
            &path,
            r#"{
                "fnug_version": "0.1.0",
                "name": "root",
                "commands": [{"name": "test", "cmd": "echo hello"}]
            }"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.root.name, "root");
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".fnug.yaml");
        std::fs::write(&path, "fnug_version: [unclosed").unwrap();
        match Config::from_file(&path) {
            Err(ConfigError::Yaml { .. }) => {}
            other => panic!("Expected ConfigError::Yaml, got: {other:?}"),
        }
    }

    #[test]
    fn find_config_walks_up_and_prefers_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(".fnug.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".fnug.yaml"), "").unwrap();

        let found = Config::find_config(&nested).unwrap();
        assert_eq!(found, dir.path().join(".fnug.yaml"));
    }

    #[test]
    fn find_config_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        match Config::find_config(dir.path()) {
            Err(ConfigError::NotFound(_)) => {}
            other => panic!("Expected ConfigError::NotFound, got: {other:?}"),
        }
    }
}
