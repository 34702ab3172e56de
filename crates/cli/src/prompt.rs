//! Terminal confirmation for open-time concerns.

use std::io::{self, BufRead, IsTerminal, Write};

use colored::Colorize;
use extvol::host::{Concern, Gate};
use tracing::{debug, info};

/// Asks on the controlling terminal, or falls back to the concern's default
/// answer when stdin is not a terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalGate {
	assume_yes: bool,
}

impl TerminalGate {
	pub fn new(assume_yes: bool) -> Self {
		Self { assume_yes }
	}
}

impl Gate for TerminalGate {
	fn proceed(&self, concern: &Concern) -> bool {
		if self.assume_yes {
			info!(target: "extvol.session", concern = concern.title(), "confirmed by --yes");
			return true;
		}
		let stdin = io::stdin();
		if !stdin.is_terminal() {
			let answer = concern.default_proceed();
			debug!(target: "extvol.session", concern = concern.title(), answer, "no terminal, using default");
			return answer;
		}
		ask(concern, &mut stdin.lock(), &mut io::stderr())
	}
}

fn ask(concern: &Concern, input: &mut impl BufRead, out: &mut impl Write) -> bool {
	let default = concern.default_proceed();
	let choices = if default { "[Y/n]" } else { "[y/N]" };
	let _ = write!(out, "{}: {} {choices} ", concern.title().yellow().bold(), concern.message());
	let _ = out.flush();

	let mut line = String::new();
	match input.read_line(&mut line) {
		Ok(0) | Err(_) => default,
		Ok(_) => parse_answer(&line).unwrap_or(default),
	}
}

fn parse_answer(line: &str) -> Option<bool> {
	match line.trim().to_lowercase().as_str() {
		"y" | "yes" => Some(true),
		"n" | "no" => Some(false),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;
	use std::path::PathBuf;

	use super::*;

	fn low_space() -> Concern {
		Concern::LowFreeSpace {
			volume: PathBuf::from("/media/vol"),
			free: 1024,
			floor: 10 * 1024 * 1024,
		}
	}

	#[test]
	fn answers_are_case_insensitive() {
		assert_eq!(parse_answer("Y\n"), Some(true));
		assert_eq!(parse_answer(" yes "), Some(true));
		assert_eq!(parse_answer("NO\n"), Some(false));
		assert_eq!(parse_answer("\n"), None);
		assert_eq!(parse_answer("maybe"), None);
	}

	#[test]
	fn empty_answer_takes_the_default() {
		let mut out = Vec::new();
		assert!(!ask(&low_space(), &mut Cursor::new("\n"), &mut out));

		let first_open = Concern::FirstOpenWithVersion {
			volume: PathBuf::from("/media/vol"),
		};
		assert!(ask(&first_open, &mut Cursor::new(""), &mut Vec::new()));
	}

	#[test]
	fn explicit_answer_overrides_the_default() {
		let mut out = Vec::new();
		assert!(ask(&low_space(), &mut Cursor::new("y\n"), &mut out));
		let prompt = String::from_utf8(out).unwrap();
		assert!(prompt.contains("[y/N]"));
		assert!(prompt.contains("/media/vol"));
	}

	#[test]
	fn assume_yes_skips_the_question() {
		assert!(TerminalGate::new(true).proceed(&low_space()));
	}
}
