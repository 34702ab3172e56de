//! Collaborators outside the session core: the mount table, free space,
//! open file handles, unmounting, and asking the user.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

use crate::settings::{self, ToolError};

#[derive(Debug, Error)]
pub enum HostError {
	#[error("failed to query {what} for {path}: {source}")]
	Query {
		what: &'static str,
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("unmount failed: {0}")]
	Unmount(#[source] ToolError),
}

/// Everything the orchestrator needs to know about the volume's host system.
pub trait VolumeHost {
	fn is_mounted(&self, mountpoint: &Path) -> Result<bool, HostError>;
	fn free_bytes(&self, mountpoint: &Path) -> Result<u64, HostError>;
	/// Paths under `mountpoint` any visible process holds open or runs from.
	fn open_files(&self, mountpoint: &Path) -> Result<Vec<PathBuf>, HostError>;
	fn unmount(&self, mountpoint: &Path) -> Result<(), HostError>;
}

/// A question the user may answer before opening proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Concern {
	LowFreeSpace { volume: PathBuf, free: u64, floor: u64 },
	/// The volume has data from an older release and is opened by this one for the first time.
	FirstOpenWithVersion { volume: PathBuf },
}

impl Concern {
	pub fn title(&self) -> &'static str {
		match self {
			Concern::LowFreeSpace { .. } => "Low free space",
			Concern::FirstOpenWithVersion { .. } => "New version",
		}
	}

	pub fn message(&self) -> String {
		match self {
			Concern::LowFreeSpace { volume, free, floor } => format!(
				"There are only {} free on {} (at least {} recommended). Open it anyway?",
				human_bytes(*free),
				volume.display(),
				human_bytes(*floor)
			),
			Concern::FirstOpenWithVersion { volume } => format!(
				"{} is being opened with this version for the first time. Some settings of older \
				 versions cannot be migrated and the password manager database will be converted. \
				 Continue?",
				volume.display()
			),
		}
	}

	/// Answer used when nobody can be asked.
	pub fn default_proceed(&self) -> bool {
		match self {
			Concern::LowFreeSpace { .. } => false,
			Concern::FirstOpenWithVersion { .. } => true,
		}
	}
}

/// Decides whether opening proceeds despite a [`Concern`].
pub trait Gate {
	fn proceed(&self, concern: &Concern) -> bool;
}

/// Gate that always gives [`Concern::default_proceed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultGate;

impl Gate for DefaultGate {
	fn proceed(&self, concern: &Concern) -> bool {
		concern.default_proceed()
	}
}

pub fn human_bytes(bytes: u64) -> String {
	const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
	let mut value = bytes as f64;
	let mut unit = 0;
	while value >= 1024.0 && unit < UNITS.len() - 1 {
		value /= 1024.0;
		unit += 1;
	}
	if unit == 0 { format!("{bytes} B") } else { format!("{value:.1} {}", UNITS[unit]) }
}

/// The real Linux host: `/proc` for mounts and open files, `statvfs` for space,
/// and a configurable unmount command.
#[derive(Debug, Clone)]
pub struct SystemHost {
	unmount: Vec<String>,
	require_mountpoint: bool,
}

impl SystemHost {
	pub fn new(unmount: Vec<String>, require_mountpoint: bool) -> Self {
		Self {
			unmount,
			require_mountpoint,
		}
	}
}

impl VolumeHost for SystemHost {
	fn is_mounted(&self, mountpoint: &Path) -> Result<bool, HostError> {
		if !self.require_mountpoint {
			return Ok(mountpoint.is_dir());
		}
		let table = fs::read_to_string("/proc/self/mountinfo").map_err(|source| HostError::Query {
			what: "mount table",
			path: mountpoint.to_path_buf(),
			source,
		})?;
		Ok(mountinfo_points(&table).any(|p| p == mountpoint))
	}

	fn free_bytes(&self, mountpoint: &Path) -> Result<u64, HostError> {
		statvfs_free(mountpoint).map_err(|source| HostError::Query {
			what: "free space",
			path: mountpoint.to_path_buf(),
			source,
		})
	}

	fn open_files(&self, mountpoint: &Path) -> Result<Vec<PathBuf>, HostError> {
		scan_open_files(Path::new("/proc"), mountpoint).map_err(|source| HostError::Query {
			what: "open files",
			path: mountpoint.to_path_buf(),
			source,
		})
	}

	fn unmount(&self, mountpoint: &Path) -> Result<(), HostError> {
		let Some((program, fixed)) = self.unmount.split_first() else {
			return Err(HostError::Unmount(ToolError::NotConfigured { tool: "unmount" }));
		};
		let mut cmd = Command::new(program);
		cmd.args(fixed)
			.arg(mountpoint)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped());
		settings::run(cmd).map_err(HostError::Unmount)
	}
}

/// Mountpoints listed in a `/proc/*/mountinfo` table.
fn mountinfo_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
	table
		.lines()
		.filter_map(|line| line.split(' ').nth(4))
		.map(|field| PathBuf::from(unescape_mount_field(field)))
}

/// Undoes the kernel's octal escaping (`\040` for space) in mount table fields.
fn unescape_mount_field(field: &str) -> String {
	let bytes = field.as_bytes();
	let mut out = Vec::with_capacity(bytes.len());
	let mut i = 0;
	while i < bytes.len() {
		let escaped = bytes[i] == b'\\'
			&& i + 3 < bytes.len()
			&& bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
		let code = escaped.then(|| {
			bytes[i + 1..i + 4]
				.iter()
				.fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'))
		});
		match code.and_then(|c| u8::try_from(c).ok()) {
			Some(byte) => {
				out.push(byte);
				i += 4;
			}
			None => {
				out.push(bytes[i]);
				i += 1;
			}
		}
	}
	String::from_utf8_lossy(&out).into_owned()
}

fn statvfs_free(path: &Path) -> io::Result<u64> {
	use std::ffi::CString;
	use std::os::unix::ffi::OsStrExt;

	let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
	let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
	let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
	if rc != 0 {
		return Err(io::Error::last_os_error());
	}
	Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Every path under `mountpoint` that a process keeps busy: open
/// descriptors, working directory, root, executable and memory-mapped files.
/// Processes that vanish or deny access are skipped.
fn scan_open_files(proc_root: &Path, mountpoint: &Path) -> io::Result<Vec<PathBuf>> {
	let mut found = Vec::new();
	for entry in fs::read_dir(proc_root)? {
		let Ok(entry) = entry else { continue };
		let is_pid = entry.file_name().to_str().is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()));
		if !is_pid {
			continue;
		}
		let dir = entry.path();
		let mut held: Vec<PathBuf> = ["cwd", "root", "exe"]
			.iter()
			.filter_map(|link| fs::read_link(dir.join(link)).ok())
			.collect();
		if let Ok(fds) = fs::read_dir(dir.join("fd")) {
			held.extend(fds.flatten().filter_map(|fd| fs::read_link(fd.path()).ok()));
		}
		if let Ok(maps) = fs::read_to_string(dir.join("maps")) {
			held.extend(mapped_paths(&maps));
		}
		for path in held {
			if path.starts_with(mountpoint) && !found.contains(&path) {
				found.push(path);
			}
		}
	}
	found.sort();
	debug!(target: "extvol.host", mountpoint = %mountpoint.display(), count = found.len(), "scanned open files");
	Ok(found)
}

/// File-backed mappings in a `/proc/<pid>/maps` table.
fn mapped_paths(maps: &str) -> impl Iterator<Item = PathBuf> + '_ {
	maps.lines().filter_map(|line| {
		let path = &line[line.find('/')?..];
		Some(PathBuf::from(path.strip_suffix(" (deleted)").unwrap_or(path)))
	})
}
