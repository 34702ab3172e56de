//! On-disk configuration and the resolved path layout.
//!
//! Every field has a default, so a missing or partial `config.json` is valid.
//! The home directory is resolved once by the caller and carried explicitly
//! in [`Layout`]; nothing in this crate reads `$HOME` on its own.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Schema version for config files.
pub const SCHEMA_VERSION: u32 = 1;

/// Name of the lock marker under the home directory.
pub const DEFAULT_LOCK_MARKER: &str = ".mounted_as_extended_volume";
/// Name of the snapshotter pid marker under the runtime directory.
pub const SNAPSHOT_PID_FILE: &str = ".extvol-snapshotter";
/// Name of the snapshotter log under the runtime directory.
pub const SNAPSHOT_LOG_FILE: &str = "extvol-snapshotter.log";

/// Below this many free bytes the user is asked whether to abort opening.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SNAPSHOT_STOP_TIMEOUT_MS: u64 = 10_000;

/// Paths under the mountpoint that background services keep open during close.
pub const DEFAULT_OPEN_FILE_ALLOWLIST: &[&str] = &[
	".local/share/hamster-applet",
	".local/share/evolution",
	".config/tracker",
	".cache/tracker",
	".local/share/tracker",
	".VirtualBox/VBoxSVC.log",
];

/// External programs, each a command prefix (program followed by fixed args).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Tools {
	pub gconftool: Vec<String>,
	pub dconf: Vec<String>,
	pub unmount: Vec<String>,
}

impl Default for Tools {
	fn default() -> Self {
		Self {
			gconftool: vec!["/usr/bin/gconftool-2".to_string()],
			dconf: vec!["/usr/bin/dconf".to_string()],
			unmount: vec!["umount".to_string()],
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtvolConfig {
	pub schema: u32,
	/// Home directory to redirect. `None` means the caller's default.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub home: Option<PathBuf>,
	/// Directory for the snapshotter pid marker and log. `None` means the temp dir.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub runtime_dir: Option<PathBuf>,
	pub lock_marker: String,
	pub min_free_bytes: u64,
	pub snapshot_interval_secs: u64,
	pub snapshot_stop_timeout_ms: u64,
	/// Refuse to close a path that is not a mountpoint.
	pub require_mountpoint: bool,
	/// Run subsystem service hooks (restarts, kills). Redirections always run.
	pub run_hooks: bool,
	pub skel_dir: PathBuf,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub disabled_handlers: Vec<String>,
	pub open_file_allowlist: Vec<PathBuf>,
	pub tools: Tools,
}

impl Default for ExtvolConfig {
	fn default() -> Self {
		Self {
			schema: SCHEMA_VERSION,
			home: None,
			runtime_dir: None,
			lock_marker: DEFAULT_LOCK_MARKER.to_string(),
			min_free_bytes: DEFAULT_MIN_FREE_BYTES,
			snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
			snapshot_stop_timeout_ms: DEFAULT_SNAPSHOT_STOP_TIMEOUT_MS,
			require_mountpoint: true,
			run_hooks: true,
			skel_dir: PathBuf::from("/etc/skel"),
			disabled_handlers: Vec::new(),
			open_file_allowlist: DEFAULT_OPEN_FILE_ALLOWLIST.iter().map(PathBuf::from).collect(),
			tools: Tools::default(),
		}
	}
}

impl ExtvolConfig {
	/// Loads a config file. A missing file yields the defaults; a malformed one is an error.
	pub fn load(path: &Path) -> Result<Self> {
		let content = match fs::read_to_string(path) {
			Ok(c) => c,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(err) => return Err(err.into()),
		};
		let config = serde_json::from_str(&content)
			.map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}: {err}", path.display())))?;
		Ok(config)
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
		fs::write(path, content)?;
		Ok(())
	}

	/// Resolves every path once, filling unset directories from the given fallbacks.
	pub fn layout(&self, default_home: PathBuf, default_runtime: PathBuf) -> Layout {
		let home = self.home.clone().unwrap_or(default_home);
		let runtime_dir = self.runtime_dir.clone().unwrap_or(default_runtime);
		Layout {
			lock_marker: home.join(&self.lock_marker),
			snapshot_pid: runtime_dir.join(SNAPSHOT_PID_FILE),
			snapshot_log: runtime_dir.join(SNAPSHOT_LOG_FILE),
			home,
			runtime_dir,
		}
	}

	pub fn handler_enabled(&self, name: &str) -> bool {
		!self.disabled_handlers.iter().any(|n| n == name)
	}
}

/// Per-user runtime directory: `$XDG_RUNTIME_DIR`, else `extvol-<uid>` under
/// the system temp directory. Never the shared temp directory itself.
pub fn default_runtime_dir() -> PathBuf {
	let uid = unsafe { libc::getuid() };
	runtime_dir_from(std::env::var_os("XDG_RUNTIME_DIR"), &std::env::temp_dir(), uid)
}

fn runtime_dir_from(xdg: Option<OsString>, temp: &Path, uid: u32) -> PathBuf {
	match xdg {
		Some(dir) if Path::new(&dir).is_absolute() => PathBuf::from(dir),
		_ => temp.join(format!("extvol-{uid}")),
	}
}

/// Concrete filesystem locations derived from [`ExtvolConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
	pub home: PathBuf,
	pub runtime_dir: PathBuf,
	pub lock_marker: PathBuf,
	pub snapshot_pid: PathBuf,
	pub snapshot_log: PathBuf,
}

#[cfg(test)]
mod tests {
	use tempfile::TempDir;

	use super::*;

	#[test]
	fn missing_file_yields_defaults() {
		let tmp = TempDir::new().unwrap();
		let config = ExtvolConfig::load(&tmp.path().join("nope.json")).unwrap();
		assert_eq!(config, ExtvolConfig::default());
		assert_eq!(config.min_free_bytes, 10 * 1024 * 1024);
	}

	#[test]
	fn partial_file_keeps_other_defaults() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("config.json");
		fs::write(&path, r#"{ "runHooks": false, "tools": { "dconf": ["/bin/sh", "fake-dconf"] } }"#).unwrap();

		let config = ExtvolConfig::load(&path).unwrap();
		assert!(!config.run_hooks);
		assert_eq!(config.tools.dconf, vec!["/bin/sh", "fake-dconf"]);
		assert_eq!(config.tools.gconftool, Tools::default().gconftool);
		assert_eq!(config.snapshot_interval_secs, DEFAULT_SNAPSHOT_INTERVAL_SECS);
	}

	#[test]
	fn malformed_file_is_an_error() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("config.json");
		fs::write(&path, "{ not json").unwrap();
		assert!(ExtvolConfig::load(&path).is_err());
	}

	#[test]
	fn save_and_load_round_trip() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("nested/config.json");
		let config = ExtvolConfig {
			home: Some(tmp.path().join("home")),
			disabled_handlers: vec!["virtualbox".into()],
			..Default::default()
		};
		config.save(&path).unwrap();
		assert_eq!(ExtvolConfig::load(&path).unwrap(), config);
	}

	#[test]
	fn layout_prefers_configured_directories() {
		let config = ExtvolConfig {
			home: Some(PathBuf::from("/srv/home")),
			..Default::default()
		};
		let layout = config.layout(PathBuf::from("/home/u"), PathBuf::from("/tmp"));
		assert_eq!(layout.home, PathBuf::from("/srv/home"));
		assert_eq!(layout.lock_marker, PathBuf::from("/srv/home/.mounted_as_extended_volume"));
		assert_eq!(layout.snapshot_pid, PathBuf::from("/tmp/.extvol-snapshotter"));
	}

	#[test]
	fn runtime_dir_is_per_user() {
		let temp = Path::new("/tmp");
		assert_eq!(
			runtime_dir_from(Some("/run/user/1000".into()), temp, 1000),
			PathBuf::from("/run/user/1000")
		);
		assert_eq!(runtime_dir_from(None, temp, 1000), PathBuf::from("/tmp/extvol-1000"));
		assert_eq!(runtime_dir_from(Some("".into()), temp, 7), PathBuf::from("/tmp/extvol-7"));
		assert_eq!(runtime_dir_from(Some("relative".into()), temp, 7), PathBuf::from("/tmp/extvol-7"));
	}
}
