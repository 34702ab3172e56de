use super::{Handler, HandlerError, SessionContext, Steps, mirror_files};
use crate::settings::SettingsKey;

/// Settings trees the snapshotter dumps on every cycle.
pub static SNAPSHOT_KEYS: &[SettingsKey] = &[
	EVOLUTION,
	HAMSTER,
	SettingsKey::gconf("/apps/hamster-indicator"),
	PLANNER,
	KEYBINDINGS,
	METACITY,
	GTHUMB,
	SEAHORSE,
	SettingsKey::dconf("/org/gnome/nautilus"),
	POWER,
	SESSION,
	MOUSE,
	TOUCHPAD,
	KEYBOARD,
	SettingsKey::dconf("/apps/onboard"),
	LIBGNOMEKBD,
	TRACKER,
];

const SEAHORSE: SettingsKey = SettingsKey::dconf("/apps/seahorse");
const EVOLUTION: SettingsKey = SettingsKey::gconf("/apps/evolution");
const HAMSTER: SettingsKey = SettingsKey::gconf("/apps/hamster-applet");
const GTHUMB: SettingsKey = SettingsKey::gconf("/apps/gthumb");
const PLANNER: SettingsKey = SettingsKey::gconf("/apps/planner");
const KEYBINDINGS: SettingsKey = SettingsKey::gconf("/desktop/gnome/keybindings");
const METACITY: SettingsKey = SettingsKey::gconf("/apps/metacity");
const POWER: SettingsKey = SettingsKey::dconf("/org/gnome/settings-daemon/plugins/power");
const SESSION: SettingsKey = SettingsKey::dconf("/org/gnome/desktop/session");
const MOUSE: SettingsKey = SettingsKey::dconf("/org/gnome/settings-daemon/peripherals/mouse");
const TOUCHPAD: SettingsKey = SettingsKey::dconf("/org/gnome/settings-daemon/peripherals/touchpad");
const KEYBOARD: SettingsKey = SettingsKey::dconf("/org/gnome/settings-daemon/peripherals/keyboard");
const BACKGROUND: SettingsKey = SettingsKey::dconf("/org/gnome/desktop/background");
const NEMO: SettingsKey = SettingsKey::dconf("/org/gnome/nemo");
const LIBGNOMEKBD: SettingsKey = SettingsKey::dconf("/org/gnome/libgnomekbd");
const TRACKER: SettingsKey = SettingsKey::dconf("/org/freedesktop/tracker");

/// Loaded before the desktop's redirections, dumped before they are undone.
const DESKTOP_EARLY_KEYS: &[SettingsKey] = &[POWER, SESSION, KEYBINDINGS, METACITY, MOUSE, TOUCHPAD, KEYBOARD];
const DESKTOP_LATE_KEYS: &[SettingsKey] = &[BACKGROUND, NEMO, LIBGNOMEKBD];

/// Every handler, in the order they run on open and on close.
pub static HANDLERS: &[Handler] = &[
	Handler {
		name: "gnupg",
		open: open_gnupg,
		close: close_gnupg,
	},
	Handler {
		name: "evolution",
		open: open_evolution,
		close: close_evolution,
	},
	Handler {
		name: "hamster",
		open: open_hamster,
		close: close_hamster,
	},
	Handler {
		name: "fpm",
		open: |ctx| dirs_open(ctx, &[".fpm"]),
		close: |ctx| dirs_close(ctx, &[".fpm"]),
	},
	Handler {
		name: "libreoffice",
		open: open_libreoffice,
		close: close_libreoffice,
	},
	Handler {
		name: "scribus",
		open: |ctx| dirs_open(ctx, &[".scribus"]),
		close: |ctx| dirs_close(ctx, &[".scribus"]),
	},
	Handler {
		name: "gimp",
		open: open_gimp,
		close: |ctx| dirs_close(ctx, &[".gimp-2.8"]),
	},
	Handler {
		name: "inkscape",
		open: |ctx| dirs_open(ctx, &[".config/inkscape"]),
		close: |ctx| dirs_close(ctx, &[".config/inkscape"]),
	},
	Handler {
		name: "gthumb",
		open: open_gthumb,
		close: close_gthumb,
	},
	Handler {
		name: "planner",
		open: |ctx| Ok(ctx.load(&PLANNER)?),
		close: |ctx| Ok(ctx.dump(&PLANNER)?),
	},
	Handler {
		name: "desktop",
		open: open_desktop,
		close: close_desktop,
	},
	Handler {
		name: "virtualbox",
		open: open_virtualbox,
		close: close_virtualbox,
	},
	Handler {
		name: "pulseaudio",
		open: open_pulseaudio,
		close: close_pulseaudio,
	},
	Handler {
		name: "grsync",
		open: |ctx| dirs_open(ctx, &[".grsync"]),
		close: |ctx| dirs_close(ctx, &[".grsync"]),
	},
	Handler {
		name: "kmymoney",
		open: |ctx| Ok(ctx.link_file(".kde/share/config/kmymoneyrc")?),
		close: |ctx| Ok(ctx.unlink_file(".kde/share/config/kmymoneyrc")?),
	},
	Handler {
		name: "icedove",
		open: open_icedove,
		close: |ctx| dirs_close(ctx, &[".icedove"]),
	},
	Handler {
		name: "tracker",
		open: open_tracker,
		close: close_tracker,
	},
	// The settings daemon holds files on the volume until it exits.
	Handler {
		name: "gconfd",
		open: |_| Ok(()),
		close: |ctx| Ok(ctx.hook(&["killall", "gconfd-2"], &[1])?),
	},
	Handler {
		name: "backintime",
		open: open_backintime,
		close: close_backintime,
	},
	Handler {
		name: "okular",
		open: open_okular,
		close: close_okular,
	},
];

fn dirs_open(ctx: &SessionContext<'_>, dirs: &[&str]) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for dir in dirs {
		steps.step(ctx.link_dir(dir));
	}
	steps.finish()
}

fn dirs_close(ctx: &SessionContext<'_>, dirs: &[&str]) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for dir in dirs {
		steps.step(ctx.unlink_dir(dir));
	}
	steps.finish()
}

fn open_gnupg(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.link_dir(".gnupg"));
	steps.step(ctx.load(&SEAHORSE));
	steps.step(ctx.restrict_permissions(".gnupg"));
	steps.finish()
}

fn close_gnupg(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.dump(&SEAHORSE));
	steps.step(ctx.unlink_dir(".gnupg"));
	steps.step(ctx.hook(&["pkill", "-HUP", "gpg-agent"], &[1]));
	steps.finish()
}

const EVOLUTION_DIRS: &[&str] = &[".local/share/evolution", ".config/evolution", ".cache/evolution"];

fn open_evolution(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	// A running instance would keep writing to the local profile.
	steps.step(ctx.hook(&["evolution", "--force-shutdown"], &[]));
	for dir in EVOLUTION_DIRS {
		steps.step(ctx.link_dir(dir));
	}
	steps.step(ctx.load(&EVOLUTION));
	steps.finish()
}

fn close_evolution(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["evolution", "--force-shutdown"], &[]));
	steps.step(ctx.dump(&EVOLUTION));
	for dir in EVOLUTION_DIRS {
		steps.step(ctx.unlink_dir(dir));
	}
	steps.finish()
}

fn open_hamster(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["pkill", "-x", "hamster-service"], &[1]));
	steps.step(ctx.migrate(".gnome2/hamster-applet", ".local/share/hamster-applet"));
	steps.step(ctx.link_dir(".local/share/hamster-applet"));
	steps.step(ctx.load(&HAMSTER));
	steps.finish()
}

fn close_hamster(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.dump(&HAMSTER));
	steps.step(ctx.unlink_dir(".local/share/hamster-applet"));
	steps.step(ctx.hook(&["pkill", "-x", "hamster-service"], &[1]));
	steps.finish()
}

fn open_libreoffice(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.migrate(".openoffice.org", ".config/libreoffice"));
	steps.step(ctx.link_dir(".config/libreoffice"));
	steps.step(ctx.link_file(".odbc.ini"));
	steps.finish()
}

fn close_libreoffice(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.unlink_dir(".config/libreoffice"));
	steps.step(ctx.unlink_file(".odbc.ini"));
	steps.finish()
}

fn open_gimp(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.link_dir(".gimp-2.8"));
	steps.step(ctx.seed_from_skel(".gimp-2.8/sessionrc"));
	steps.finish()
}

fn open_gthumb(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.link_dir(".config/gthumb"));
	steps.step(ctx.load(&GTHUMB));
	steps.finish()
}

fn close_gthumb(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.unlink_dir(".config/gthumb"));
	steps.step(ctx.dump(&GTHUMB));
	steps.finish()
}

const DESKTOP_FILES: &[&str] = &[".gtk-bookmarks", ".lockpasswd"];

fn open_desktop(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for key in DESKTOP_EARLY_KEYS {
		steps.step(ctx.load(key));
	}
	steps.step(ctx.migrate(".fonts", ".local/share/fonts"));
	steps.step(ctx.link_dir(".local/share/fonts"));
	for file in DESKTOP_FILES {
		steps.step(ctx.link_file(file));
	}
	for key in DESKTOP_LATE_KEYS {
		steps.step(ctx.load(key));
	}
	steps.finish()
}

fn close_desktop(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for key in DESKTOP_EARLY_KEYS {
		steps.step(ctx.dump(key));
	}
	steps.step(ctx.unlink_dir(".local/share/fonts"));
	for file in DESKTOP_FILES {
		steps.step(ctx.unlink_file(file));
	}
	for key in DESKTOP_LATE_KEYS {
		steps.step(ctx.dump(key));
	}
	// The background may point at an image on the volume.
	steps.step(ctx.reset(&BACKGROUND));
	steps.finish()
}

fn open_virtualbox(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.link_dir(".VirtualBox"));
	steps.step(ctx.link_dir("VirtualBox VMs"));
	steps.step(ctx.link_file(".vbox-starter.conf"));
	steps.finish()
}

fn close_virtualbox(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["pkill", "VBoxSVC"], &[1]));
	steps.step(ctx.unlink_dir(".VirtualBox"));
	steps.step(ctx.unlink_dir("VirtualBox VMs"));
	steps.step(ctx.unlink_file(".vbox-starter.conf"));
	steps.finish()
}

const PULSE_DIR: &str = ".config/pulse";

/// Pulseaudio rewrites its directory atomically, which breaks symlinks, so
/// its files are copied across instead of redirected.
fn open_pulseaudio(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let volume = ctx.mountpoint.join(PULSE_DIR);
	if !volume.is_dir() {
		std::fs::create_dir_all(&volume).map_err(|source| super::StepError::Io { path: volume, source })?;
		return Ok(());
	}
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["pulseaudio", "--kill"], &[1]));
	steps.step(mirror_files(&volume, &ctx.home().join(PULSE_DIR)));
	steps.step(ctx.hook(&["pulseaudio", "--start"], &[]));
	steps.finish()
}

fn close_pulseaudio(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["pulseaudio", "--kill"], &[1]));
	steps.step(mirror_files(&ctx.home().join(PULSE_DIR), &ctx.mountpoint.join(PULSE_DIR)));
	steps.step(ctx.hook(&["pulseaudio", "--start"], &[]));
	steps.finish()
}

fn open_icedove(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.seed_from_skel(".icedove"));
	steps.step(ctx.link_dir(".icedove"));
	steps.finish()
}

const TRACKER_DIRS: &[&str] = &[".cache/tracker", ".config/tracker", ".local/share/tracker"];

fn open_tracker(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["tracker-control", "-k", "all"], &[]));
	for dir in TRACKER_DIRS {
		steps.step(ctx.link_dir(dir));
	}
	steps.step(ctx.load(&TRACKER));
	steps.step(ctx.hook(&["tracker-control", "-s"], &[]));
	steps.finish()
}

fn close_tracker(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	steps.step(ctx.hook(&["tracker-control", "-k", "all"], &[]));
	for dir in TRACKER_DIRS {
		steps.step(ctx.unlink_dir(dir));
	}
	steps.step(ctx.dump(&TRACKER));
	steps.step(ctx.hook(&["tracker-control", "-s"], &[]));
	steps.finish()
}

const BACKINTIME_DIRS: &[&str] = &[".config/backintime", ".local/share/backintime"];

fn open_backintime(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for dir in BACKINTIME_DIRS {
		steps.step(ctx.link_dir(dir));
	}
	steps.step(ctx.hook(&["backintime", "check-config"], &[]));
	steps.finish()
}

/// Unlinks first so the final backup runs with the local configuration restored.
fn close_backintime(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for dir in BACKINTIME_DIRS {
		steps.step(ctx.unlink_dir(dir));
	}
	steps.step(ctx.hook(&["backintime", "backup"], &[]));
	steps.finish()
}

const OKULAR_FILES: &[&str] = &[".kde/share/config/okularrc", ".kde/share/config/okularpartrc"];

fn open_okular(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for file in OKULAR_FILES {
		steps.step(ctx.link_file(file));
	}
	steps.step(ctx.link_dir(".kde/share/apps/okular"));
	steps.finish()
}

fn close_okular(ctx: &SessionContext<'_>) -> Result<(), HandlerError> {
	let mut steps = Steps::new();
	for file in OKULAR_FILES {
		steps.step(ctx.unlink_file(file));
	}
	steps.step(ctx.unlink_dir(".kde/share/apps/okular"));
	steps.finish()
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::path::Path;

	use tempfile::TempDir;

	use super::*;
	use crate::config::Tools;
	use crate::redirect::PathRedirector;
	use crate::settings::SettingsBridge;

	fn recording_bridge(dir: &Path) -> (SettingsBridge, std::path::PathBuf) {
		let log = dir.join("calls.log");
		let script = dir.join("tool.sh");
		fs::write(&script, format!("echo \"$*\" >> \"{}\"\n", log.display())).unwrap();
		let tool = vec!["/bin/sh".to_string(), script.to_string_lossy().into_owned()];
		let bridge = SettingsBridge::new(&Tools {
			gconftool: tool.clone(),
			dconf: tool,
			unmount: vec![],
		});
		(bridge, log)
	}

	#[test]
	fn desktop_close_dumps_then_resets_background() {
		let tmp = TempDir::new().unwrap();
		let mnt = tmp.path().join("vol");
		fs::create_dir_all(&mnt).unwrap();
		let (bridge, log) = recording_bridge(tmp.path());
		let redirector = PathRedirector::new(tmp.path().join("home"));
		let ctx = SessionContext {
			mountpoint: &mnt,
			redirector: &redirector,
			bridge: &bridge,
			skel_dir: tmp.path(),
			run_hooks: false,
		};

		close_desktop(&ctx).unwrap();
		let calls = fs::read_to_string(&log).unwrap();
		let lines: Vec<&str> = calls.lines().collect();
		assert_eq!(lines.last(), Some(&"reset -f /org/gnome/desktop/background/"));
		assert!(lines.contains(&"dump /org/gnome/desktop/background/"));
		assert!(mnt.join(".keybindings-backup.xml.dump").exists());
	}

	#[test]
	fn legacy_fonts_are_migrated_before_linking() {
		let tmp = TempDir::new().unwrap();
		let mnt = tmp.path().join("vol");
		fs::create_dir_all(mnt.join(".fonts")).unwrap();
		fs::write(mnt.join(".fonts/custom.ttf"), "font").unwrap();
		let (bridge, _log) = recording_bridge(tmp.path());
		let redirector = PathRedirector::new(tmp.path().join("home"));
		let ctx = SessionContext {
			mountpoint: &mnt,
			redirector: &redirector,
			bridge: &bridge,
			skel_dir: tmp.path(),
			run_hooks: false,
		};

		open_desktop(&ctx).unwrap();
		let local = tmp.path().join("home/.local/share/fonts/custom.ttf");
		assert_eq!(fs::read_to_string(local).unwrap(), "font");
		assert!(tmp.path().join("home/.gtk-bookmarks").is_symlink());

		close_desktop(&ctx).unwrap();
		assert!(!tmp.path().join("home/.local/share/fonts").exists());
	}

	#[test]
	fn pulseaudio_mirrors_instead_of_linking() {
		let tmp = TempDir::new().unwrap();
		let mnt = tmp.path().join("vol");
		let home = tmp.path().join("home");
		fs::create_dir_all(&mnt).unwrap();
		let (bridge, _log) = recording_bridge(tmp.path());
		let redirector = PathRedirector::new(&home);
		let ctx = SessionContext {
			mountpoint: &mnt,
			redirector: &redirector,
			bridge: &bridge,
			skel_dir: tmp.path(),
			run_hooks: false,
		};

		open_pulseaudio(&ctx).unwrap();
		assert!(mnt.join(PULSE_DIR).is_dir());

		fs::create_dir_all(home.join(PULSE_DIR)).unwrap();
		fs::write(home.join(PULSE_DIR).join("default.pa"), "x").unwrap();
		close_pulseaudio(&ctx).unwrap();
		assert!(mnt.join(PULSE_DIR).join("default.pa").is_file());
		assert!(!home.join(PULSE_DIR).is_symlink());
	}
}
