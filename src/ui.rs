//! Colored console status lines.
//!
//! Step headers, success, warning and error lines each get their own color so
//! a long deployment log can be skimmed. Set `NO_COLOR` to get plain text.

use std::sync::OnceLock;

const HEADER: &str = "\x1b[95m";
const BLUE: &str = "\x1b[94m";
const CYAN: &str = "\x1b[96m";
const GREEN: &str = "\x1b[92m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";
const BOLD: &str = "\x1b[1m";
const END: &str = "\x1b[0m";

/// Width of the `=====` rules printed under headers.
pub const RULE_WIDTH: usize = 60;

fn colors_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("NO_COLOR").is_none())
}

fn paint(codes: &[&str], text: &str) -> String {
    if !colors_enabled() {
        return text.to_string();
    }
    format!("{}{}{}", codes.concat(), text, END)
}

pub fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// `[n/total] message` header followed by a rule.
pub fn step(step_num: usize, total_steps: usize, message: &str) {
    println!(
        "\n{}",
        paint(&[BOLD, CYAN], &format!("[{step_num}/{total_steps}] {message}"))
    );
    println!("{}", rule());
}

pub fn success(message: &str) {
    println!("{}", paint(&[GREEN], &format!("✓ {message}")));
}

pub fn warning(message: &str) {
    println!("{}", paint(&[YELLOW], &format!("⚠ {message}")));
}

pub fn error(message: &str) {
    eprintln!("{}", paint(&[RED], &format!("✗ {message}")));
}

/// Announce an external command before it runs.
pub fn running(description: &str, command_line: &str) {
    println!("\n{}", paint(&[BLUE], &format!("Running: {description}")));
    println!("Command: {command_line}");
}

pub fn error_output(stderr: &str) {
    eprintln!("{}", paint(&[RED], "Error output:"));
    eprintln!("{stderr}");
}

/// Framed multi-line banner, e.g. the start and end of a deployment.
pub fn banner(lines: &[&str]) {
    println!("\n{}", paint(&[HEADER, BOLD], &rule()));
    for line in lines {
        println!("{}", paint(&[HEADER, BOLD], &format!("  {line}")));
    }
    println!("{}", paint(&[HEADER, BOLD], &rule()));
}

pub fn outcome_banner(ok: bool, headline: &str) {
    let codes: &[&str] = if ok { &[GREEN, BOLD] } else { &[RED, BOLD] };
    println!("\n{}", paint(codes, &rule()));
    println!("{}", paint(codes, &format!("  {headline}")));
    println!("{}", paint(codes, &rule()));
}

pub fn note(message: &str) {
    println!("{}", paint(&[CYAN], message));
}

pub fn interrupted(message: &str) {
    eprintln!("\n\n{}", paint(&[YELLOW], message));
}

/// Format a byte count with thousands separators (`2,097,152`).
pub fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Format a byte count as mebibytes with two decimals.
pub fn mebibytes(n: u64) -> String {
    format!("{:.2} MB", n as f64 / 1024.0 / 1024.0)
}
