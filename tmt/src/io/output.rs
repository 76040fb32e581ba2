//! User-facing progress output.
//!
//! Separate from `tracing`: this is what a user reads on stdout during a run.
//! Lines are `key: value` indented by nesting level. Warnings and errors go to
//! stderr as `[WARN] ...` / `[ERROR] ...`. Colour only when the stream is a TTY.

use std::io::IsTerminal;

use crate::core::result::Outcome;

const INDENT: &str = "    ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Bold,
}

impl Color {
    fn code(self) -> &'static str {
        match self {
            Color::Red => "31",
            Color::Green => "32",
            Color::Yellow => "33",
            Color::Blue => "34",
            Color::Magenta => "35",
            Color::Bold => "1",
        }
    }

    pub fn for_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Pass => Color::Green,
            Outcome::Fail => Color::Red,
            Outcome::Info => Color::Blue,
            Outcome::Warn => Color::Yellow,
            Outcome::Error => Color::Magenta,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Printer {
    verbose: u8,
    quiet: bool,
    color: bool,
    err_color: bool,
}

impl Printer {
    pub fn new(verbose: u8, quiet: bool) -> Self {
        Self {
            verbose,
            quiet,
            color: std::io::stdout().is_terminal(),
            err_color: std::io::stderr().is_terminal(),
        }
    }

    /// A printer that prints nothing but warnings and errors.
    pub fn silent() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn verbosity(&self) -> u8 {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn paint(&self, text: &str, color: Color) -> String {
        paint(text, color, self.color)
    }

    /// Bold section heading (plan or step name).
    pub fn header(&self, text: &str, indent: usize) {
        if self.quiet {
            return;
        }
        println!("{}{}", INDENT.repeat(indent), self.paint(text, Color::Bold));
    }

    pub fn info(&self, key: &str, value: &str, indent: usize) {
        if self.quiet {
            return;
        }
        println!("{}", format_entry(key, value, indent));
    }

    /// Only shown with at least `level` `-v` flags.
    pub fn detail(&self, key: &str, value: &str, indent: usize, level: u8) {
        if self.verbose < level {
            return;
        }
        self.info(key, value, indent);
    }

    /// Print a line regardless of `--quiet` (listing commands).
    pub fn line(&self, text: &str) {
        println!("{text}");
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", paint("[WARN]", Color::Yellow, self.err_color));
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {message}", paint("[ERROR]", Color::Red, self.err_color));
    }
}

/// `key: value` with indentation; an empty value prints the key alone.
pub fn format_entry(key: &str, value: &str, indent: usize) -> String {
    let pad = INDENT.repeat(indent);
    if value.is_empty() {
        format!("{pad}{key}")
    } else {
        format!("{pad}{key}: {value}")
    }
}

pub fn paint(text: &str, color: Color, enabled: bool) -> String {
    if enabled {
        format!("\x1b[{}m{text}\x1b[0m", color.code())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_entry_indents_key_value() {
        assert_eq!(format_entry("how", "fmf", 1), "    how: fmf");
        assert_eq!(format_entry("discover", "", 0), "discover");
    }

    #[test]
    fn paint_only_when_enabled() {
        assert_eq!(paint("pass", Color::Green, false), "pass");
        assert_eq!(paint("pass", Color::Green, true), "\x1b[32mpass\x1b[0m");
    }

    #[test]
    fn outcome_colors_are_distinct() {
        let colors: Vec<Color> = Outcome::ALL.iter().map(|o| Color::for_outcome(*o)).collect();
        for (i, a) in colors.iter().enumerate() {
            for b in &colors[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
