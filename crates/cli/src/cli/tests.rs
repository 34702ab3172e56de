use std::path::PathBuf;

use clap::Parser;

use super::*;

#[test]
fn parse_open_command() {
	let cli = Cli::try_parse_from(["extvol", "open", "/media/vol"]).unwrap();

	assert_eq!(cli.verbose, 0);
	assert_eq!(cli.format, OutputFormat::Text);
	assert!(!cli.yes);
	match cli.command {
		Commands::Open(args) => assert_eq!(args.mountpoint, PathBuf::from("/media/vol")),
		_ => panic!("Expected Open command"),
	}
}

#[test]
fn open_requires_a_mountpoint() {
	assert!(Cli::try_parse_from(["extvol", "open"]).is_err());
	assert!(Cli::try_parse_from(["extvol", "close"]).is_err());
}

#[test]
fn global_flags_work_after_the_subcommand() {
	let cli = Cli::try_parse_from([
		"extvol",
		"close",
		"/media/vol",
		"-vv",
		"-f",
		"json",
		"--config",
		"/etc/extvol.json",
		"--yes",
	])
	.unwrap();

	assert_eq!(cli.verbose, 2);
	assert_eq!(cli.format, OutputFormat::Json);
	assert_eq!(cli.config, Some(PathBuf::from("/etc/extvol.json")));
	assert!(cli.yes);
	assert_eq!(cli.command.name(), "close");
}

#[test]
fn short_yes_flag() {
	let cli = Cli::try_parse_from(["extvol", "-y", "open", "/media/vol"]).unwrap();
	assert!(cli.yes);
}

#[test]
fn rejects_unknown_format() {
	assert!(Cli::try_parse_from(["extvol", "-f", "yaml", "status"]).is_err());
}

#[test]
fn parse_status_and_handlers() {
	let cli = Cli::try_parse_from(["extvol", "status"]).unwrap();
	assert!(matches!(cli.command, Commands::Status));

	let cli = Cli::try_parse_from(["extvol", "handlers"]).unwrap();
	assert!(matches!(cli.command, Commands::Handlers));
}

fn snapshot_args(argv: &[&str]) -> SnapshotArgs {
	let mut full = vec!["extvol", "snapshot"];
	full.extend_from_slice(argv);
	match Cli::try_parse_from(full).unwrap().command {
		Commands::Snapshot(args) => args,
		_ => panic!("Expected Snapshot command"),
	}
}

#[test]
fn snapshot_defaults_to_start() {
	let args = snapshot_args(&[]);
	assert_eq!(args.mode(), SnapshotMode::Start);
	assert_eq!(args.target, None);
	assert!(args.extra.is_empty());

	assert_eq!(snapshot_args(&["-r"]).mode(), SnapshotMode::Start);
}

#[test]
fn snapshot_modes() {
	assert_eq!(snapshot_args(&["-q"]).mode(), SnapshotMode::Stop);
	assert_eq!(snapshot_args(&["-d"]).mode(), SnapshotMode::Dump);
	assert_eq!(
		snapshot_args(&["-r", "--foreground", "-t", "/media/vol"]).mode(),
		SnapshotMode::Foreground
	);
}

#[test]
fn snapshot_target() {
	let args = snapshot_args(&["-t", "/media/vol/.extvol"]);
	assert_eq!(args.target, Some(PathBuf::from("/media/vol/.extvol")));
}

#[test]
fn snapshot_actions_conflict() {
	assert!(Cli::try_parse_from(["extvol", "snapshot", "-r", "-q"]).is_err());
	assert!(Cli::try_parse_from(["extvol", "snapshot", "-q", "-d"]).is_err());
	assert!(Cli::try_parse_from(["extvol", "snapshot", "-d", "--foreground"]).is_err());
}

#[test]
fn snapshot_accepts_unknown_options() {
	let args = snapshot_args(&["-r", "-t", "/media/vol", "--legacy-flag", "-z"]);
	assert_eq!(args.mode(), SnapshotMode::Start);
	assert_eq!(args.target, Some(PathBuf::from("/media/vol")));
	assert_eq!(args.extra, vec!["--legacy-flag".to_string(), "-z".to_string()]);
}
