//! Runs the real `extvol` binary against a scratch home and volume.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

const DCONF: &str = r#"case "$1" in
	dump) printf '[/]\nsaved=true\n' ;;
	load) cat > /dev/null ;;
esac
exit 0
"#;

const GCONFTOOL: &str = r#"case "$1" in
	--dump) echo '<gconfentryfile/>' ;;
esac
exit 0
"#;

struct Env {
	tmp: TempDir,
}

impl Env {
	fn new() -> Self {
		let tmp = TempDir::new().unwrap();
		for dir in ["home", "run", "media/vol", "media/other"] {
			fs::create_dir_all(tmp.path().join(dir)).unwrap();
		}
		let tool = |name: &str, script: &str| {
			let path = tmp.path().join(name);
			fs::write(&path, script).unwrap();
			json!(["/bin/sh", path])
		};
		let config = json!({
			"home": tmp.path().join("home"),
			"runtimeDir": tmp.path().join("run"),
			"minFreeBytes": 0,
			"requireMountpoint": false,
			"runHooks": false,
			"skelDir": tmp.path().join("skel"),
			"tools": {
				"gconftool": tool("gconftool.sh", GCONFTOOL),
				"dconf": tool("dconf.sh", DCONF),
				"unmount": ["true"],
			},
		});
		fs::write(tmp.path().join("config.json"), config.to_string()).unwrap();
		Self { tmp }
	}

	fn path(&self, rel: &str) -> PathBuf {
		self.tmp.path().join(rel)
	}

	fn vol(&self) -> PathBuf {
		self.path("media/vol")
	}

	fn marker(&self) -> PathBuf {
		self.path("home/.mounted_as_extended_volume")
	}

	fn pid_file(&self) -> PathBuf {
		self.path("run/.extvol-snapshotter")
	}

	fn run(&self, args: &[&str]) -> Output {
		Command::new(env!("CARGO_BIN_EXE_extvol"))
			.arg("--config")
			.arg(self.path("config.json"))
			.args(["-f", "json", "--yes"])
			.args(args)
			.current_dir(self.tmp.path())
			.env_remove("RUST_LOG")
			.output()
			.unwrap()
	}

	fn set_config(&self, key: &str, value: Value) {
		let path = self.path("config.json");
		let mut config: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
		config[key] = value;
		fs::write(&path, config.to_string()).unwrap();
	}

	fn run_path(&self, command: &str, path: &Path) -> Output {
		self.run(&[command, path.to_str().unwrap()])
	}
}

impl Drop for Env {
	fn drop(&mut self) {
		// Never leave a snapshotter behind when a test fails halfway.
		if let Ok(marker) = fs::read_to_string(self.pid_file()) {
			if let Some(pid) = marker.split_whitespace().next() {
				let _ = Command::new("kill").arg(pid).status();
			}
		}
	}
}

fn envelope(out: &Output) -> Value {
	serde_json::from_slice(&out.stdout).unwrap_or_else(|err| {
		panic!(
			"stdout is not an envelope ({err}): {}\nstderr: {}",
			String::from_utf8_lossy(&out.stdout),
			String::from_utf8_lossy(&out.stderr)
		)
	})
}

fn succeeded(out: &Output) -> Value {
	assert!(
		out.status.success(),
		"command failed: {}",
		String::from_utf8_lossy(&out.stderr)
	);
	let value = envelope(out);
	assert_eq!(value["ok"], true, "{value}");
	value
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(10);
	while !cond() {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		thread::sleep(Duration::from_millis(50));
	}
}

#[test]
fn open_then_close_restores_home() {
	let env = Env::new();

	let opened = succeeded(&env.run_path("open", &env.vol()));
	assert_eq!(opened["command"], "open");
	let pid = opened["data"]["snapshotterPid"].as_u64().expect("snapshotter pid");
	assert!(env.marker().is_file());
	assert!(env.path("home/.gnupg").is_symlink());

	let dump = env.vol().join(".nautilus-backup.txt.dump");
	wait_for("first snapshot", || dump.is_file());
	assert!(fs::read_to_string(&dump).unwrap().contains("saved=true"));

	let status = succeeded(&env.run(&["status"]));
	assert_eq!(status["data"]["active"], true);
	assert_eq!(status["data"]["snapshotterPid"].as_u64(), Some(pid));

	let closed = succeeded(&env.run_path("close", &env.vol()));
	assert_eq!(closed["data"]["closed"], true);
	assert_eq!(closed["data"]["snapshotterStopped"], true);
	assert_eq!(closed["data"]["unmounted"], true);

	assert!(!env.marker().exists());
	assert!(!env.pid_file().exists());
	assert!(!env.path("home/.gnupg").is_symlink());

	let status = succeeded(&env.run(&["status"]));
	assert_eq!(status["data"]["active"], false);
}

#[test]
fn failing_shutdown_hook_does_not_skip_evolution_links() {
	let env = Env::new();
	let bin = env.path("bin");
	fs::create_dir_all(&bin).unwrap();
	fs::write(bin.join("evolution"), "#!/bin/sh\nexit 3\n").unwrap();
	fs::set_permissions(bin.join("evolution"), fs::Permissions::from_mode(0o755)).unwrap();
	env.set_config("runHooks", json!(true));

	// Only the failing hook is reachable; every other hook program is absent and skipped.
	let out = Command::new(env!("CARGO_BIN_EXE_extvol"))
		.arg("--config")
		.arg(env.path("config.json"))
		.args(["-f", "json", "--yes", "open"])
		.arg(env.vol())
		.current_dir(env.tmp.path())
		.env("PATH", &bin)
		.env_remove("RUST_LOG")
		.output()
		.unwrap();
	let opened = succeeded(&out);
	let failures = opened["data"]["failures"].as_array().expect("failures");
	assert!(failures.iter().any(|f| f["handler"] == "evolution"), "{opened}");
	for dir in [".local/share/evolution", ".config/evolution", ".cache/evolution"] {
		assert_eq!(fs::read_link(env.path("home").join(dir)).unwrap(), env.vol().join(dir));
	}

	env.set_config("runHooks", json!(false));
	succeeded(&env.run_path("close", &env.vol()));
	assert!(!env.path("home/.config/evolution").is_symlink());
}

#[test]
fn second_volume_is_refused_and_first_still_closes() {
	let env = Env::new();
	succeeded(&env.run_path("open", &env.vol()));

	let refused = env.run_path("open", &env.path("media/other"));
	assert_eq!(refused.status.code(), Some(1));
	let value = envelope(&refused);
	assert_eq!(value["ok"], false);
	assert_eq!(value["error"]["code"], "SESSION_ACTIVE");

	// A close for the other volume targets nothing and is reported, not failed.
	let skipped = succeeded(&env.run_path("close", &env.path("media/other")));
	assert_eq!(skipped["data"]["closed"], false);
	assert!(env.marker().is_file());

	// Every invocation is a fresh process, as after a crash of the opener.
	succeeded(&env.run_path("close", &env.vol()));
	assert!(!env.marker().exists());
}

#[test]
fn close_without_a_session_is_a_skip() {
	let env = Env::new();

	let out = env.run_path("close", &env.vol());
	let value = succeeded(&out);
	assert_eq!(value["data"]["closed"], false);
	let diagnostics = value["diagnostics"].as_array().unwrap();
	assert!(diagnostics[0]["message"].as_str().unwrap().contains("no session"));
}

#[test]
fn snapshot_commands_drive_the_detached_snapshotter() {
	let env = Env::new();
	let vol = env.vol();
	let vol = vol.to_str().unwrap();

	let idle = succeeded(&env.run(&["snapshot", "-q"]));
	assert_eq!(idle["data"]["running"], false);

	let started = succeeded(&env.run(&["snapshot", "-r", "-t", vol, "--legacy-option"]));
	let pid = started["data"]["pid"].as_u64().unwrap();
	assert!(env.pid_file().is_file());

	let dumped = succeeded(&env.run(&["snapshot", "-d"]));
	assert_eq!(dumped["data"]["pid"].as_u64(), Some(pid));
	wait_for("dump", || env.vol().join(".evolution-backup.xml.dump").is_file());

	let again = env.run(&["snapshot", "-r", "-t", vol]);
	assert_eq!(again.status.code(), Some(1));
	assert_eq!(envelope(&again)["error"]["code"], "SNAPSHOT_FAILED");

	let stopped = succeeded(&env.run(&["snapshot", "-q"]));
	assert_eq!(stopped["data"]["running"], true);
	assert!(!env.pid_file().exists());

	let log = fs::read_to_string(env.path("run/extvol-snapshotter.log")).unwrap();
	assert!(log.contains("settings dumped"), "{log}");
}

#[test]
fn handlers_are_listed_in_open_order() {
	let env = Env::new();
	let value = succeeded(&env.run(&["handlers"]));
	let handlers = value["data"]["handlers"].as_array().unwrap();
	assert!(!handlers.is_empty());
	for (i, handler) in handlers.iter().enumerate() {
		assert_eq!(handler["order"].as_u64(), Some(i as u64 + 1));
		assert_eq!(handler["enabled"], true);
	}
}

#[test]
fn malformed_config_is_invalid_input() {
	let env = Env::new();
	fs::write(env.path("config.json"), "{ broken").unwrap();

	let out = env.run(&["status"]);
	assert_eq!(out.status.code(), Some(1));
	assert_eq!(envelope(&out)["error"]["code"], "INVALID_INPUT");
}
