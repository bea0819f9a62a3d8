//! The resolved command tree.
//!
//! [`crate::config`] holds the document as written; this module holds the tree
//! after inheritance resolution. Resolution is a single walk from the root:
//! each node merges the parent's resolved working directory, automation rules,
//! and environment into its own declared values before its children are
//! visited. Resolved nodes are immutable afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::config::{ConfigAuto, ConfigCommand, ConfigCommandGroup, ConfigError};
use crate::select::cached_regex;

/// Resolved automation rules for a node.
///
/// The `Option<bool>` fields of the document collapse to concrete booleans
/// here; `path` entries are absolute and `regex` patterns are validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Auto {
    /// Consider file-system events.
    pub watch: bool,
    /// Consider uncommitted git changes.
    pub git: bool,
    /// Select unconditionally.
    pub always: bool,
    /// Directory roots to observe, absolute after resolution.
    pub path: Vec<PathBuf>,
    /// Patterns a changed path must match, validated at load time.
    pub regex: Vec<String>,
}

/// A single executable task with its resolved configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Command {
    pub id: String,
    pub name: String,
    pub cmd: String,
    pub cwd: PathBuf,
    pub interactive: bool,
    pub auto: Auto,
    pub env: HashMap<String, String>,
    pub depends_on: Vec<String>,
    pub scrollback: Option<usize>,
}

impl Command {
    /// Whether the terminal widget may take keyboard focus for this command.
    #[must_use]
    pub fn can_focus(&self) -> bool {
        self.interactive
    }
}

/// Hierarchical grouping of related commands.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandGroup {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    pub auto: Auto,
    pub env: HashMap<String, String>,
    pub commands: Vec<Command>,
    pub children: Vec<CommandGroup>,
}

impl CommandGroup {
    /// Resolve a parsed document into a runtime tree rooted at `cwd`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Regex`] if any declared pattern fails to compile.
    pub(crate) fn resolve(config: ConfigCommandGroup, cwd: &Path) -> Result<Self, ConfigError> {
        let root = Scope {
            cwd: cwd.to_path_buf(),
            ..Scope::default()
        };
        resolve_group(config, &root)
    }

    /// Returns every command in this group and its children, in the order
    /// they appear in the source document.
    #[must_use]
    pub fn all_commands(&self) -> Vec<&Command> {
        self.commands
            .iter()
            .chain(self.children.iter().flat_map(|child| child.all_commands()))
            .collect()
    }

    /// Look up a command anywhere in the tree by id.
    #[must_use]
    pub fn get_command(&self, id: &str) -> Option<&Command> {
        self.all_commands().into_iter().find(|cmd| cmd.id == id)
    }

    /// Serialize the resolved tree back to YAML, preserving field order.
    ///
    /// # Errors
    ///
    /// Returns the underlying serializer error, which only occurs for paths
    /// that are not valid UTF-8.
    pub fn as_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// Join a declared working directory onto the parent's resolved one.
/// Empty means "same as parent"; absolute paths stand alone.
fn inherit_path(parent: &Path, child: Option<PathBuf>) -> PathBuf {
    match child {
        None => parent.to_path_buf(),
        Some(child) if child.as_os_str().is_empty() => parent.to_path_buf(),
        Some(child) if child.is_relative() => parent.join(child),
        Some(child) => child,
    }
}

/// The inherited state carried down the tree during resolution.
#[derive(Debug, Clone, Default)]
struct Scope {
    cwd: PathBuf,
    watch: Option<bool>,
    git: Option<bool>,
    always: Option<bool>,
    path: Vec<PathBuf>,
    regex: Vec<String>,
    env: HashMap<String, String>,
}

impl Scope {
    /// Merge a node's declared values into this scope, producing the scope
    /// its descendants inherit from.
    fn descend(
        &self,
        cwd: Option<PathBuf>,
        auto: Option<&ConfigAuto>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<Scope, ConfigError> {
        let declared = auto.cloned().unwrap_or_default();
        let cwd = inherit_path(&self.cwd, cwd);

        // Union with the parent's resolved roots; declared entries resolve
        // against this node's cwd.
        let mut path = self.path.clone();
        for declared_path in declared.path.unwrap_or_default() {
            let absolute = inherit_path(&cwd, Some(declared_path));
            if !path.contains(&absolute) {
                path.push(absolute);
            }
        }

        let mut regex = self.regex.clone();
        for pattern in declared.regex.unwrap_or_default() {
            cached_regex(&pattern).map_err(|e| ConfigError::Regex {
                source: Box::new(e),
                pattern: pattern.clone(),
            })?;
            if !regex.contains(&pattern) {
                regex.push(pattern);
            }
        }

        let mut merged_env = self.env.clone();
        if let Some(declared_env) = env {
            merged_env.extend(declared_env.clone());
        }

        Ok(Scope {
            cwd,
            watch: declared.watch.or(self.watch),
            git: declared.git.or(self.git),
            always: declared.always.or(self.always),
            path,
            regex,
            env: merged_env,
        })
    }

    /// Collapse the scope into the concrete rules stored on a resolved node.
    fn auto(&self) -> Auto {
        Auto {
            watch: self.watch.unwrap_or(false),
            git: self.git.unwrap_or(false),
            always: self.always.unwrap_or(false),
            path: self.path.clone(),
            regex: self.regex.clone(),
        }
    }
}

fn resolve_group(config: ConfigCommandGroup, parent: &Scope) -> Result<CommandGroup, ConfigError> {
    let scope = parent.descend(config.cwd, config.auto.as_ref(), config.env.as_ref())?;

    let commands = config
        .commands
        .unwrap_or_default()
        .into_iter()
        .map(|cmd| resolve_command(cmd, &scope))
        .collect::<Result<Vec<Command>, ConfigError>>()?;
    let children = config
        .children
        .unwrap_or_default()
        .into_iter()
        .map(|child| resolve_group(child, &scope))
        .collect::<Result<Vec<CommandGroup>, ConfigError>>()?;

    Ok(CommandGroup {
        id: config.id.unwrap_or_else(generate_id),
        name: config.name,
        cwd: scope.cwd.clone(),
        auto: scope.auto(),
        env: scope.env.clone(),
        commands,
        children,
    })
}

fn resolve_command(config: ConfigCommand, parent: &Scope) -> Result<Command, ConfigError> {
    let scope = parent.descend(config.cwd, config.auto.as_ref(), config.env.as_ref())?;

    Ok(Command {
        id: config.id.unwrap_or_else(generate_id),
        name: config.name,
        cmd: config.cmd,
        cwd: scope.cwd.clone(),
        interactive: config.interactive.unwrap_or(false),
        auto: scope.auto(),
        env: scope.env.clone(),
        depends_on: config.depends_on.unwrap_or_default(),
        scrollback: config.scrollback,
    })
}

/// Synthesize a random 128-bit id for nodes that don't declare one.
fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
