#[cfg(test)]
mod tests;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::output::OutputFormat;
use crate::styles::cli_styles;

/// Root CLI for extvol.
#[derive(Parser, Debug)]
#[command(name = "extvol")]
#[command(about = "Carry your desktop configuration on a removable volume")]
#[command(version)]
#[command(styles = cli_styles())]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Output format: text (default) or json
	#[arg(short = 'f', long, global = true, value_enum, default_value = "text")]
	pub format: OutputFormat,

	/// Configuration file (default: $EXTVOL_CONFIG, then ~/.config/extvol/config.json)
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Answer every confirmation with yes
	#[arg(short = 'y', long, global = true)]
	pub yes: bool,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Redirect the configuration catalogue onto a mounted volume and start snapshots.
	Open(VolumeArgs),
	/// Write everything back to the volume, restore home and unmount.
	Close(VolumeArgs),
	/// Show the session owner and the snapshotter.
	Status,
	/// List subsystem handlers in the order they open.
	Handlers,
	/// Control the periodic settings snapshotter.
	Snapshot(SnapshotArgs),
}

impl Commands {
	/// Name used in the output envelope.
	pub fn name(&self) -> &'static str {
		match self {
			Commands::Open(_) => "open",
			Commands::Close(_) => "close",
			Commands::Status => "status",
			Commands::Handlers => "handlers",
			Commands::Snapshot(_) => "snapshot",
		}
	}
}

#[derive(Args, Debug, Clone)]
pub struct VolumeArgs {
	/// Mountpoint of the volume
	#[arg(value_name = "MOUNTPOINT")]
	pub mountpoint: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct SnapshotArgs {
	/// Directory the settings dumps are written to (default: current directory)
	#[arg(short = 't', long = "target", value_name = "DIR")]
	pub target: Option<PathBuf>,

	/// Start the snapshotter (the default action)
	#[arg(short = 'r', long = "run", conflicts_with_all = ["quit", "dump"])]
	pub run: bool,

	/// Stop the running snapshotter
	#[arg(short = 'q', long = "quit", conflicts_with = "dump")]
	pub quit: bool,

	/// Ask the running snapshotter for an immediate dump
	#[arg(short = 'd', long = "dump")]
	pub dump: bool,

	/// Run the snapshot loop in this process instead of detaching
	#[arg(long, conflicts_with_all = ["quit", "dump"])]
	pub foreground: bool,

	/// Unrecognised options, accepted and ignored
	#[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
	pub extra: Vec<String>,
}

/// What `extvol snapshot` was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
	Start,
	Foreground,
	Stop,
	Dump,
}

impl SnapshotArgs {
	pub fn mode(&self) -> SnapshotMode {
		if self.quit {
			SnapshotMode::Stop
		} else if self.dump {
			SnapshotMode::Dump
		} else if self.foreground {
			SnapshotMode::Foreground
		} else {
			SnapshotMode::Start
		}
	}
}
