//! Dumping and loading external settings trees.
//!
//! Each key is serialized by its backend's command-line tool into a dump file
//! at the volume root named `.<leaf>-backup.<ext>`. The presence of that file
//! is the only signal that a load should happen.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Tools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
	/// GConf, dumped as XML by `gconftool-2`.
	Gconf,
	/// dconf, dumped as keyfile text by `dconf`.
	Dconf,
}

impl Backend {
	pub fn extension(self) -> &'static str {
		match self {
			Backend::Gconf => "xml.dump",
			Backend::Dconf => "txt.dump",
		}
	}
}

impl fmt::Display for Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Backend::Gconf => write!(f, "gconf"),
			Backend::Dconf => write!(f, "dconf"),
		}
	}
}

/// A settings tree such as `/org/gnome/desktop/session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SettingsKey {
	pub backend: Backend,
	pub path: &'static str,
}

impl SettingsKey {
	pub const fn gconf(path: &'static str) -> Self {
		Self {
			backend: Backend::Gconf,
			path,
		}
	}

	pub const fn dconf(path: &'static str) -> Self {
		Self {
			backend: Backend::Dconf,
			path,
		}
	}

	/// Last path segment of the key.
	pub fn leaf(&self) -> &'static str {
		let trimmed = self.path.trim_end_matches('/');
		trimmed.rsplit('/').next().unwrap_or(trimmed)
	}

	pub fn dump_file(&self, mountpoint: &Path) -> PathBuf {
		mountpoint.join(format!(".{}-backup.{}", self.leaf(), self.backend.extension()))
	}

	/// Where a dump is written before it replaces [`SettingsKey::dump_file`].
	pub fn partial_file(&self, mountpoint: &Path) -> PathBuf {
		self.dump_file(mountpoint).with_extension(PARTIAL_EXTENSION)
	}

	/// dconf addresses directories with a trailing slash.
	fn dir_path(&self) -> String {
		format!("{}/", self.path.trim_end_matches('/'))
	}
}

impl fmt::Display for SettingsKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.backend, self.path)
	}
}

const PARTIAL_EXTENSION: &str = "partial";

/// Whether `path` is a dump still being written by [`SettingsBridge::dump`].
pub fn is_partial_dump(path: &Path) -> bool {
	let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
		return false;
	};
	name.starts_with('.') && name.contains("-backup.") && name.ends_with(&format!(".{PARTIAL_EXTENSION}"))
}

/// An external settings tool could not be run or reported failure.
#[derive(Debug, Error)]
pub enum ToolError {
	#[error("{tool} is not configured")]
	NotConfigured { tool: &'static str },

	#[error("failed to run {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: io::Error,
	},

	#[error("{program} exited with {status}{}", stderr_suffix(.stderr))]
	Status {
		program: String,
		status: ExitStatus,
		stderr: String,
	},

	#[error("{path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

fn stderr_suffix(stderr: &str) -> String {
	let line = stderr.lines().next().unwrap_or("").trim();
	if line.is_empty() { String::new() } else { format!(": {line}") }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
	Loaded,
	/// No dump on the volume yet, e.g. the first session.
	NoDump,
}

#[derive(Debug, Clone)]
pub struct SettingsBridge {
	gconftool: Vec<String>,
	dconf: Vec<String>,
}

impl SettingsBridge {
	pub fn new(tools: &Tools) -> Self {
		Self {
			gconftool: tools.gconftool.clone(),
			dconf: tools.dconf.clone(),
		}
	}

	/// Writes the key's tree to its dump file. An existing dump is only replaced
	/// once the tool has succeeded.
	pub fn dump(&self, mountpoint: &Path, key: &SettingsKey) -> Result<PathBuf, ToolError> {
		let target = key.dump_file(mountpoint);
		let partial = key.partial_file(mountpoint);
		debug!(target: "extvol.settings", key = %key, file = %target.display(), "dump");

		let dir = key.dir_path();
		let mut cmd = match key.backend {
			Backend::Gconf => self.command(Backend::Gconf, &["--dump", key.path])?,
			Backend::Dconf => self.command(Backend::Dconf, &["dump", dir.as_str()])?,
		};
		let out = File::create(&partial).map_err(|source| ToolError::Io {
			path: partial.clone(),
			source,
		})?;
		cmd.stdin(Stdio::null()).stdout(out);

		if let Err(err) = run(cmd) {
			let _ = fs::remove_file(&partial);
			return Err(err);
		}
		fs::rename(&partial, &target).map_err(|source| ToolError::Io {
			path: target.clone(),
			source,
		})?;
		Ok(target)
	}

	pub fn load(&self, mountpoint: &Path, key: &SettingsKey) -> Result<LoadOutcome, ToolError> {
		let file = key.dump_file(mountpoint);
		if !file.is_file() {
			debug!(target: "extvol.settings", key = %key, "no dump to load");
			return Ok(LoadOutcome::NoDump);
		}
		debug!(target: "extvol.settings", key = %key, file = %file.display(), "load");

		let cmd = match key.backend {
			Backend::Gconf => {
				let file_arg = file.to_string_lossy().into_owned();
				let mut cmd = self.command(Backend::Gconf, &["--load", file_arg.as_str()])?;
				cmd.stdin(Stdio::null());
				cmd
			}
			Backend::Dconf => {
				let input = File::open(&file).map_err(|source| ToolError::Io {
					path: file.clone(),
					source,
				})?;
				let dir = key.dir_path();
				let mut cmd = self.command(Backend::Dconf, &["load", dir.as_str()])?;
				cmd.stdin(input);
				cmd
			}
		};
		run(cmd)?;
		Ok(LoadOutcome::Loaded)
	}

	/// Clears a dconf tree back to its defaults. GConf keys are left as they are.
	pub fn reset(&self, key: &SettingsKey) -> Result<(), ToolError> {
		if key.backend != Backend::Dconf {
			return Ok(());
		}
		let dir = key.dir_path();
		let mut cmd = self.command(Backend::Dconf, &["reset", "-f", dir.as_str()])?;
		cmd.stdin(Stdio::null());
		run(cmd)
	}

	/// Dumps every key, returning the ones that failed. Used by the snapshotter.
	pub fn dump_all<'k>(&self, mountpoint: &Path, keys: &'k [SettingsKey]) -> Vec<(&'k SettingsKey, ToolError)> {
		let mut failed = Vec::new();
		for key in keys {
			if let Err(err) = self.dump(mountpoint, key) {
				warn!(target: "extvol.settings", key = %key, error = %err, "dump failed");
				failed.push((key, err));
			}
		}
		failed
	}

	fn command(&self, backend: Backend, args: &[&str]) -> Result<Command, ToolError> {
		let (prefix, tool) = match backend {
			Backend::Gconf => (&self.gconftool, "gconftool"),
			Backend::Dconf => (&self.dconf, "dconf"),
		};
		let (program, fixed) = prefix.split_first().ok_or(ToolError::NotConfigured { tool })?;
		let mut cmd = Command::new(program);
		cmd.args(fixed).args(args).stderr(Stdio::piped());
		Ok(cmd)
	}
}

/// Runs a prepared command to completion; nonzero exit is a failure.
pub(crate) fn run(mut cmd: Command) -> Result<(), ToolError> {
	let program = cmd.get_program().to_string_lossy().into_owned();
	let child = cmd.spawn().map_err(|source| ToolError::Spawn {
		program: program.clone(),
		source,
	})?;
	let output = child.wait_with_output().map_err(|source| ToolError::Spawn {
		program: program.clone(),
		source,
	})?;
	if output.status.success() {
		Ok(())
	} else {
		Err(ToolError::Status {
			program,
			status: output.status,
			stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
		})
	}
}
