//! Core engine of the Fnug command runner.
//!
//! Fnug turns a declarative tree of lint/test commands into executable,
//! observable work: it loads and resolves the configuration, selects commands
//! whose watched paths intersect uncommitted git changes or live file-system
//! events, and runs each selected command inside its own pseudo-terminal with
//! a rendered, scrollable output stream.
//!
//! The TUI, CLI, and git-hook layers are consumers of this crate; nothing in
//! here draws to a screen.

use std::path::{Path, PathBuf};

use log::debug;

use crate::command::{Command, CommandGroup};
use crate::config::{Config, ConfigCommandGroup, ConfigError};
use crate::select::select_on_demand;
use crate::watch::{WatchError, WatcherStream};

pub mod command;
pub mod config;
pub mod pty;
pub mod select;
pub mod watch;

/// The engine facade: a resolved command tree plus the working directory it
/// was resolved against.
pub struct Fnug {
    config: CommandGroup,
    cwd: PathBuf,
}

impl Fnug {
    /// Build from a programmatically constructed tree, resolving inheritance
    /// against `cwd`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the tree contains invalid regexes, duplicate
    /// ids, empty names or commands, or broken dependency references.
    pub fn from_group(group: ConfigCommandGroup, cwd: &Path) -> Result<Self, ConfigError> {
        let config = CommandGroup::resolve(group, cwd)?;
        config::validate_tree(&config)?;
        Ok(Self {
            config,
            cwd: cwd.to_path_buf(),
        })
    }

    /// Load a configuration file. With `None`, discovery walks upward from
    /// the process working directory. The file's directory becomes the
    /// tree's root cwd.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if no file is found, it cannot be parsed, or
    /// the tree fails validation.
    pub fn from_config_file(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match config_file {
            Some(file) => {
                if !file.exists() {
                    return Err(ConfigError::NotFound(file.to_path_buf()));
                }
                file.to_path_buf()
            }
            None => {
                let start =
                    std::env::current_dir().map_err(ConfigError::UnknownWorkingDirectory)?;
                Config::find_config(&start)?
            }
        };
        let cwd = config_path
            .parent()
            .ok_or_else(|| ConfigError::NotFound(config_path.clone()))?
            .to_path_buf();
        debug!(
            "Loading config {} (cwd: {})",
            config_path.display(),
            cwd.display()
        );
        let parsed = Config::from_file(&config_path)?;
        Self::from_group(parsed.root, &cwd)
    }

    /// Every command in the tree, in document order.
    #[must_use]
    pub fn all_commands(&self) -> Vec<&Command> {
        self.config.all_commands()
    }

    /// Commands that should run right now: the `always` selection followed
    /// by the git selection, deduplicated.
    #[must_use]
    pub fn selected_commands(&self) -> Vec<&Command> {
        select_on_demand(&self.config, &self.cwd)
    }

    /// Construct the long-lived stream that yields commands to run as
    /// file-system events arrive.
    ///
    /// # Errors
    ///
    /// Returns `WatchError` if the OS file watcher cannot be created.
    pub fn watch(&self) -> Result<WatcherStream, WatchError> {
        WatcherStream::new(self.config.clone(), self.cwd.clone())
    }

    /// The resolved command tree.
    #[must_use]
    pub fn config(&self) -> &CommandGroup {
        &self.config
    }

    /// The working directory the tree was resolved against.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}
