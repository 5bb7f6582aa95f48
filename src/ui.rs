use console::{style, StyledObject, Term};
use dialoguer::{Confirm, Input};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::error::PlacerError;

// ── Terminal helpers ──────────────────────────────────────────────────────────

fn term_width() -> usize {
    Term::stdout().size().1.max(60) as usize
}

fn rule() -> String {
    "─".repeat(term_width().min(52))
}

// ── Banner ────────────────────────────────────────────────────────────────────

pub fn print_banner() {
    println!();
    println!(
        "{}",
        style("   package-to-image-placer").cyan().bold()
    );
    println!(
        "{}",
        style(format!(
            "   zip packages → GPT image partitions  ·  v{}",
            env!("CARGO_PKG_VERSION")
        ))
        .dim()
        .italic()
    );
    println!();
    println!("{}", style(rule()).dim());
    println!();
}

// ── Step header ───────────────────────────────────────────────────────────────

/// Numbered section header, e.g. ` 2/3   Copying Packages`.
pub fn print_step(step: u8, total: u8, title: &str) {
    println!();
    println!(
        "{}{}",
        style(format!(" {}/{} ", step, total)).black().on_cyan().bold(),
        style(format!("  {}", title)).white().bold()
    );
    println!("{}", style(rule()).dim());
}

// ── Feedback messages ─────────────────────────────────────────────────────────

fn marked(mark: StyledObject<&str>, msg: impl std::fmt::Display) -> String {
    format!("  {}  {}", mark.bold(), msg)
}

pub fn print_success(msg: &str) {
    println!("{}", marked(style("✓").green(), style(msg).green()));
}

pub fn print_info(msg: &str) {
    println!("{}", marked(style("→").blue(), msg));
}

/// Non-fatal notice; the run continues.
pub fn print_warning(msg: &str) {
    println!("{}", marked(style("⚠").yellow(), style(msg).yellow()));
}

/// Goes to stderr so it survives a redirected stdout.
pub fn print_error(msg: &str) {
    eprintln!("{}", marked(style("✗").red(), style(msg).red()));
}

// ── Summary box ───────────────────────────────────────────────────────────────

const KEY_WIDTH: usize = 13;

/// Bordered key/value listing. The box widens to fit the longest value.
///
/// ```text
/// ┌─ Run Summary ──────────────┐
/// │  Target       out.img      │
/// │  Partitions   1, 3         │
/// └────────────────────────────┘
/// ```
pub fn print_kv_box(title: &str, rows: &[(&str, &str)]) {
    let widest = rows
        .iter()
        .map(|(_, val)| val.chars().count())
        .max()
        .unwrap_or(0);
    let inner = (KEY_WIDTH + widest + 4).max(title.chars().count() + 6).max(38);

    let top = "─".repeat(inner - title.chars().count() - 3);
    println!("  ┌─ {} {}┐", style(title).white().bold(), style(top).dim());
    for (key, val) in rows {
        let pad = inner - KEY_WIDTH - 2 - val.chars().count();
        println!(
            "  │  {:<width$}{}{}│",
            style(*key).dim(),
            style(*val).white().bold(),
            " ".repeat(pad),
            width = KEY_WIDTH
        );
    }
    println!("  └{}┘", style("─".repeat(inner)).dim());
}

// ── Spinner / progress ────────────────────────────────────────────────────────

/// Returns a running braille spinner.
/// Call `pb.finish_and_clear()` (or `done_spinner`) when done.
pub fn spinner(msg: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(st) = ProgressStyle::with_template("  {spinner:.cyan.bold}  {msg}") {
        pb.set_style(st.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.into());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Clears the spinner and prints a success message in its place.
pub fn done_spinner(pb: ProgressBar, msg: &str) {
    pb.finish_and_clear();
    print_success(msg);
}

/// Byte-count progress bar for bulk copies.
pub fn byte_progress(total: u64, msg: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(st) = ProgressStyle::with_template(
        "  {msg}  [{bar:32.cyan/blue}] {bytes}/{total_bytes} ({eta})",
    ) {
        pb.set_style(st.progress_chars("█▉▊▋▌▍▎▏ "));
    }
    pb.set_message(msg.into());
    pb
}

// ── Prompts ───────────────────────────────────────────────────────────────────

/// Source of user decisions. The terminal implementation asks through
/// `dialoguer`; non-interactive callers never reach it.
pub trait Prompt {
    fn confirm(&self, message: &str) -> Result<bool, PlacerError>;

    fn input(&self, message: &str, default: &str) -> Result<String, PlacerError>;
}

pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn confirm(&self, message: &str) -> Result<bool, PlacerError> {
        Ok(Confirm::new()
            .with_prompt(message)
            .default(false)
            .interact()?)
    }

    fn input(&self, message: &str, default: &str) -> Result<String, PlacerError> {
        Ok(Input::new()
            .with_prompt(message)
            .default(default.to_string())
            .interact_text()?)
    }
}
