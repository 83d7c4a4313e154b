//! Persistent record of applied side-effect resources.
//!
//! The state file maps each graph node name to the id, kind, inputs, and
//! outputs of its last successful create. Previous inputs feed `diff` on the
//! next apply.

use std::collections::BTreeMap;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
#[cfg(unix)]
use cap_std::fs_utf8::OpenOptionsExt;
use cap_std::{
    ambient_authority,
    fs_utf8::{Dir, OpenOptions},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource::{Inputs, ResourceKind};

/// Default state file location, relative to the working directory.
pub const DEFAULT_STATE_PATH: &str = ".sshprov/state.json";

/// Permission bits of the state file; it holds connection secrets.
#[cfg(unix)]
const STATE_FILE_MODE: u32 = 0o600;

/// Last successful create of one resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Tracking identifier issued by create.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Inputs the effect ran with.
    pub inputs: Inputs,
    /// Outputs the effect produced.
    pub outputs: Inputs,
}

/// All applied resources, keyed by node name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Records keyed by node name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
}

impl State {
    /// Returns the record for `name`, if one was applied.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Stores `record` under `name`, replacing any previous record.
    pub fn record(&mut self, name: impl Into<String>, record: ResourceRecord) {
        self.resources.insert(name.into(), record);
    }
}

/// Errors raised while reading or writing the state file.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state file holds invalid JSON.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the state path has no file name.
    #[error("state path {path} is missing a file name")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// Reads and writes the JSON state file.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    /// Creates a store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the state; a missing file yields an empty state.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when the file cannot be read or parsed.
    pub fn load(&self) -> Result<State, StateStoreError> {
        let (parent, file_name) = self.split()?;
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(State::default()),
            Err(err) => return Err(io_error(parent, &err)),
        };

        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(State::default()),
            Err(err) => return Err(io_error(&self.path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(State::default());
        }

        serde_json::from_str(&contents).map_err(|err| StateStoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    /// Writes the state, creating parent directories as needed. The file is
    /// replaced atomically via a sibling temporary file created owner-only
    /// (`0600`) on Unix.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError`] when serialisation or any file operation
    /// fails.
    pub fn save(&self, state: &State) -> Result<(), StateStoreError> {
        let (parent, file_name) = self.split()?;
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;

        let rendered = serde_json::to_string_pretty(state).map_err(|err| StateStoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;

        let staging = format!(".{file_name}.tmp");
        match dir.remove_file(&staging) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&self.path, &err)),
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(STATE_FILE_MODE);
        let mut file = dir
            .open_with(&staging, &options)
            .map_err(|err| io_error(&self.path, &err))?;
        file.write_all(rendered.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| io_error(&self.path, &err))?;
        drop(file);
        dir.rename(&staging, &dir, file_name)
            .map_err(|err| io_error(&self.path, &err))
    }

    fn split(&self) -> Result<(&Utf8Path, &str), StateStoreError> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| StateStoreError::InvalidPath {
                path: self.path.clone(),
            })?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        Ok((parent, file_name))
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
