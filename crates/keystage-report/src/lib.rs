use std::fmt::Write;
use std::io::{self, IsTerminal};

use console::Style;
use keystage_domain::{
    ApplyReport, NodeId, NodeOutcome, NodeResult, Operation, Phase, PlanAction, PlanReport,
    PlannedChange,
};

mod error;
mod options;
mod redaction;

pub use error::ReportError;
pub use options::{ColorChoice, OutputFormat, RenderOptions};
pub use redaction::{REDACTED, redact_sensitive};

/// Render a plan report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_plan(
    report: &PlanReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|source| ReportError::JsonSerialize { source }),
        OutputFormat::Text => Ok(render_plan_text(report, options)),
    }
}

/// Render an apply, rotate or destroy report in the requested output format.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn render_apply(
    report: &ApplyReport,
    format: OutputFormat,
    options: &RenderOptions,
) -> std::result::Result<String, ReportError> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|source| ReportError::JsonSerialize { source }),
        OutputFormat::Text => Ok(render_apply_text(report, options)),
    }
}

// ---------------------------------------------------------------------------
// Plan text
// ---------------------------------------------------------------------------

fn render_plan_text(report: &PlanReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);
    let suffix = format!("[{}]", report.workflow);

    append_header(
        &mut output,
        "plan",
        options.target.as_deref(),
        Some(&style.dim(&suffix)),
        style,
    );

    if report.changes.is_empty() {
        let _ = writeln!(output, "  Nothing to do.");
        append_warnings_and_errors(&mut output, &report.warnings, &report.errors, style);
        return output;
    }

    let (changed, noops): (Vec<&PlannedChange>, Vec<&PlannedChange>) = report
        .changes
        .iter()
        .partition(|change| change.would_change() || change.error.is_some());

    let _ = writeln!(output);
    append_warnings_and_errors(&mut output, &report.warnings, &report.errors, style);
    for change in &changed {
        append_plan_line(&mut output, change, options, style);
    }

    if options.verbose {
        for change in &noops {
            append_plan_line(&mut output, change, options, style);
        }
    } else if !noops.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "  {}", style.dim(&unchanged_summary(&noops)));
    }

    let _ = writeln!(output);
    let tally = PlanTally::from_changes(&report.changes);
    let _ = writeln!(output, "{}", tally.format(style));

    output
}

fn append_plan_line(
    output: &mut String,
    change: &PlannedChange,
    options: &RenderOptions,
    style: TextStyle,
) {
    let (symbol, label) = plan_marker(change, style);
    let deferred = if change.deferred {
        format!(" {}", style.dim("(known after apply)"))
    } else {
        String::new()
    };
    let _ = writeln!(
        output,
        "  {symbol} {label}{}{deferred}",
        node_detail(change.kind.as_str(), change.node.as_str(), change.phase, style)
    );

    if let Some(reason) = &change.reason
        && (options.verbose || change.would_change())
    {
        let _ = writeln!(output, "    {}", style.dim(reason));
    }

    if options.verbose && !change.dependencies.is_empty() {
        let dependencies: Vec<&str> = change.dependencies.iter().map(NodeId::as_str).collect();
        let _ = writeln!(
            output,
            "    {}",
            style.dim(&format!("after: {}", dependencies.join(", ")))
        );
    }

    if let Some(error) = &change.error {
        let _ = writeln!(output, "    {} {error}", style.emphasis(Tone::Error, "error:"));
    }
}

fn plan_marker(change: &PlannedChange, style: TextStyle) -> (String, String) {
    if change.error.is_some() {
        return style.marker(Tone::Error, "!", "error");
    }

    match change.action {
        PlanAction::Create => style.marker(Tone::Create, "+", "create"),
        PlanAction::Update => style.marker(Tone::Update, "~", "update"),
        PlanAction::Destroy => style.marker(Tone::Destroy, "-", "destroy"),
        PlanAction::Noop => style.marker(Tone::Quiet, "=", "up to date"),
    }
}

fn unchanged_summary(noops: &[&PlannedChange]) -> String {
    let setup = noops
        .iter()
        .filter(|change| change.phase == Phase::Setup)
        .count();
    let consume = noops.len() - setup;
    let mut parts = Vec::new();
    if setup > 0 {
        parts.push(format!("{setup} setup"));
    }
    if consume > 0 {
        parts.push(format!("{consume} consume"));
    }
    format!("{} unchanged ({})", noops.len(), parts.join(", "))
}

// ---------------------------------------------------------------------------
// Apply text
// ---------------------------------------------------------------------------

fn render_apply_text(report: &ApplyReport, options: &RenderOptions) -> String {
    let mut output = String::new();
    let style = TextStyle::new(options.color);
    let transition = format!("[{} -> {}]", report.workflow_before, report.workflow_after);

    append_header(
        &mut output,
        report.operation.as_str(),
        options.target.as_deref(),
        Some(&style.dim(&transition)),
        style,
    );

    if report.results.is_empty() {
        let _ = writeln!(output, "  {}", nothing_done(report.operation));
        append_warnings_and_errors(&mut output, &[], &report.errors, style);
        append_credentials(&mut output, report, options, style);
        return output;
    }

    let (active, unchanged): (Vec<&NodeResult>, Vec<&NodeResult>) = report
        .results
        .iter()
        .partition(|result| result.outcome != NodeOutcome::Unchanged);

    let _ = writeln!(output);
    append_warnings_and_errors(&mut output, &[], &report.errors, style);
    for result in &active {
        append_result_line(&mut output, result, options, style);
    }

    if options.verbose {
        for result in &unchanged {
            append_result_line(&mut output, result, options, style);
        }
    } else if !unchanged.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "  {}",
            style.dim(&format!("{} unchanged", unchanged.len()))
        );
    }

    append_credentials(&mut output, report, options, style);

    let _ = writeln!(output);
    let tally = ApplyTally::from_results(&report.results);
    let _ = writeln!(output, "{}", tally.format(report.operation, style));

    output
}

const fn nothing_done(operation: Operation) -> &'static str {
    match operation {
        Operation::Rotate => "Credentials rotated.",
        Operation::Apply | Operation::Destroy => "Nothing to do.",
    }
}

fn append_result_line(
    output: &mut String,
    result: &NodeResult,
    options: &RenderOptions,
    style: TextStyle,
) {
    let (tone, symbol, label) = outcome_marker_parts(result.outcome);
    let (symbol, label) = style.marker(tone, symbol, label);
    let mut extra = String::new();
    if let Some(blocked_by) = &result.blocked_by
        && blocked_by != &result.node
    {
        extra = format!(" {}", style.dim(&format!("(blocked by {blocked_by})")));
    }
    if result.attempts > 1 {
        let _ = write!(
            extra,
            " {}",
            style.dim(&format!("({} attempts)", result.attempts))
        );
    }
    let _ = writeln!(
        output,
        "  {symbol} {label}{}{extra}",
        node_detail(result.kind.as_str(), result.node.as_str(), result.phase, style)
    );

    if let Some(error) = &result.error
        && (options.verbose || result.outcome == NodeOutcome::Failed)
    {
        let _ = writeln!(output, "                     {}", style.paint(Tone::Error, error));
    }
}

const fn outcome_marker_parts(outcome: NodeOutcome) -> (Tone, &'static str, &'static str) {
    match outcome {
        NodeOutcome::Applied => (Tone::Create, "+", "applied"),
        NodeOutcome::Destroyed => (Tone::Destroy, "-", "destroyed"),
        NodeOutcome::Unchanged => (Tone::Quiet, "=", "unchanged"),
        NodeOutcome::Failed => (Tone::Error, "!", "failed"),
        NodeOutcome::Skipped => (Tone::Skip, ">", "skipped"),
        NodeOutcome::Cancelled => (Tone::Skip, "x", "cancelled"),
    }
}

fn append_credentials(
    output: &mut String,
    report: &ApplyReport,
    options: &RenderOptions,
    style: TextStyle,
) {
    if report.credentials.is_empty()
        || !(options.verbose || report.operation == Operation::Rotate)
    {
        return;
    }
    let _ = writeln!(output);
    for fingerprint in &report.credentials {
        let expiry = fingerprint
            .expires_at
            .map_or_else(String::new, |at| format!(", expires {}", at.to_rfc3339()));
        let _ = writeln!(
            output,
            "  {} {}",
            style.dim(&format!("credential {}:", fingerprint.phase)),
            style.dim(&format!(
                "{} ({}{expiry})",
                fingerprint.id, fingerprint.access_key_hint
            ))
        );
    }
}

// ---------------------------------------------------------------------------
// Shared line pieces
// ---------------------------------------------------------------------------

fn append_header(
    output: &mut String,
    command: &str,
    target: Option<&str>,
    suffix: Option<&str>,
    style: TextStyle,
) {
    let _ = write!(output, "{}", style.emphasis(Tone::Primary, command));
    if let Some(t) = target {
        let _ = write!(output, " {}", style.dim(t));
    }
    if let Some(s) = suffix {
        let _ = write!(output, " {s}");
    }
    let _ = writeln!(output);
}

fn node_detail(kind: &str, node: &str, phase: Phase, style: TextStyle) -> String {
    format!(
        "{} {} {}",
        style.dim(kind),
        style.paint(Tone::Primary, node),
        style.dim(&format!("({phase})"))
    )
}

fn append_warnings_and_errors(
    output: &mut String,
    warnings: &[String],
    errors: &[String],
    style: TextStyle,
) {
    if warnings.is_empty() && errors.is_empty() {
        return;
    }
    let _ = writeln!(output);
    for w in warnings {
        let _ = writeln!(output, "  {} {w}", style.emphasis(Tone::Warn, "warn:"));
    }
    for e in errors {
        let _ = writeln!(output, "  {} {e}", style.emphasis(Tone::Error, "error:"));
    }
}

// ---------------------------------------------------------------------------
// Tallies
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PlanTally {
    creates: usize,
    updates: usize,
    destroys: usize,
    errors: usize,
    unchanged: usize,
}

impl PlanTally {
    fn from_changes(changes: &[PlannedChange]) -> Self {
        let mut tally = Self::default();
        for change in changes {
            if change.error.is_some() {
                tally.errors += 1;
                continue;
            }
            match change.action {
                PlanAction::Create => tally.creates += 1,
                PlanAction::Update => tally.updates += 1,
                PlanAction::Destroy => tally.destroys += 1,
                PlanAction::Noop => tally.unchanged += 1,
            }
        }
        tally
    }

    fn format(&self, style: TextStyle) -> String {
        let mut parts = Vec::new();
        if self.creates > 0 {
            parts.push(style.paint(Tone::Create, format!("{} to create", self.creates)));
        }
        if self.updates > 0 {
            parts.push(style.paint(Tone::Update, format!("{} to update", self.updates)));
        }
        if self.destroys > 0 {
            parts.push(style.paint(Tone::Destroy, format!("{} to destroy", self.destroys)));
        }
        if self.errors > 0 {
            parts.push(style.paint(Tone::Error, format!("{} error", self.errors)));
        }
        if self.unchanged > 0 {
            parts.push(style.dim(&format!("{} unchanged", self.unchanged)));
        }
        if parts.is_empty() {
            format!("{} nothing to do", style.emphasis(Tone::Primary, "Plan:"))
        } else {
            format!("{} {}", style.emphasis(Tone::Primary, "Plan:"), parts.join(", "))
        }
    }
}

#[derive(Default)]
struct ApplyTally {
    applied: usize,
    destroyed: usize,
    failed: usize,
    skipped: usize,
    unchanged: usize,
}

impl ApplyTally {
    fn from_results(results: &[NodeResult]) -> Self {
        let mut tally = Self::default();
        for result in results {
            match result.outcome {
                NodeOutcome::Applied => tally.applied += 1,
                NodeOutcome::Destroyed => tally.destroyed += 1,
                NodeOutcome::Failed => tally.failed += 1,
                NodeOutcome::Skipped | NodeOutcome::Cancelled => tally.skipped += 1,
                NodeOutcome::Unchanged => tally.unchanged += 1,
            }
        }
        tally
    }

    fn format(&self, operation: Operation, style: TextStyle) -> String {
        let mut parts = Vec::new();
        if self.applied > 0 {
            parts.push(style.paint(Tone::Create, format!("{} applied", self.applied)));
        }
        if self.destroyed > 0 {
            parts.push(style.paint(Tone::Destroy, format!("{} destroyed", self.destroyed)));
        }
        if self.failed > 0 {
            parts.push(style.paint(Tone::Error, format!("{} failed", self.failed)));
        }
        if self.skipped > 0 {
            parts.push(style.paint(Tone::Skip, format!("{} not run", self.skipped)));
        }
        if self.unchanged > 0 {
            parts.push(style.dim(&format!("{} unchanged", self.unchanged)));
        }
        let label = match operation {
            Operation::Apply => "Applied:",
            Operation::Rotate => "Rotated:",
            Operation::Destroy => "Destroyed:",
        };
        if parts.is_empty() {
            format!("{} nothing to do", style.emphasis(Tone::Primary, label))
        } else {
            format!("{} {}", style.emphasis(Tone::Primary, label), parts.join(", "))
        }
    }
}

// ---------------------------------------------------------------------------
// TextStyle
// ---------------------------------------------------------------------------

const LABEL_WIDTH: usize = 12;

/// Colour roles used across plan and apply output.
#[derive(Debug, Clone, Copy)]
enum Tone {
    Create,
    Update,
    Destroy,
    Error,
    Skip,
    Warn,
    Quiet,
    Primary,
}

impl Tone {
    fn style(self) -> Style {
        // Only called once colour is decided; bypass console's own TTY check.
        let base = Style::new().force_styling(true);
        match self {
            Self::Create => base.green(),
            Self::Update => base.cyan(),
            Self::Destroy => base.magenta(),
            Self::Error => base.red(),
            Self::Skip | Self::Warn => base.yellow(),
            Self::Quiet => base.dim(),
            Self::Primary => base.white(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TextStyle {
    color_enabled: bool,
}

impl TextStyle {
    fn new(choice: ColorChoice) -> Self {
        Self {
            color_enabled: should_color(choice),
        }
    }

    fn paint<T: std::fmt::Display>(self, tone: Tone, text: T) -> String {
        if self.color_enabled {
            tone.style().apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn emphasis<T: std::fmt::Display>(self, tone: Tone, text: T) -> String {
        if self.color_enabled {
            tone.style().bold().apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn dim(self, text: &str) -> String {
        self.paint(Tone::Quiet, text)
    }

    /// Bold symbol plus a label padded to a fixed visible width.
    fn marker(self, tone: Tone, symbol: &str, label: &str) -> (String, String) {
        let painted = self.paint(tone, label);
        // ANSI codes take no columns.
        let visible_len = console::measure_text_width(&painted);
        let padded = if visible_len < LABEL_WIDTH {
            format!("{painted}{}", " ".repeat(LABEL_WIDTH - visible_len))
        } else {
            format!("{painted} ")
        };
        (self.emphasis(tone, symbol), padded)
    }
}

fn should_color(choice: ColorChoice) -> bool {
    match choice {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => io::stdout().is_terminal(),
    }
}
