//! Help output colours.

use clap::builder::Styles;
use clap::builder::styling::AnsiColor;

/// Headers and usage in bold yellow, literals and placeholders in blue.
pub fn cli_styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Yellow.on_default().bold())
		.usage(AnsiColor::Yellow.on_default().bold())
		.literal(AnsiColor::Blue.on_default().bold())
		.placeholder(AnsiColor::Blue.on_default())
		.valid(AnsiColor::Green.on_default())
		.invalid(AnsiColor::Red.on_default())
}
