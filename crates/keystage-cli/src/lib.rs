// Target-specific transitive dependency split (mio/crossterm stack) is accepted for now.
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand, ValueEnum};
use keystage_engine::{
    CancelFlag, Config, Executor, ExecutorOptions, FileStateStore, LogFormat, PhaseSelection,
    StateStore, Workflow, build_destroy_plan, load_config, load_manifests, manifest_root,
    unbuildable_plan, unlock,
};
use keystage_report::{
    ColorChoice, OutputFormat, RenderOptions, redact_sensitive, render_apply, render_plan,
};
use minus::{ExitStrategy, Pager, page_all};
use tracing::{debug, info, warn};

mod error;
mod logging;

pub use error::CliError;
pub use logging::LOG_ENV;

use logging::{init_logging, log_filter};

#[derive(Debug, Parser)]
#[command(
    name = "keystage",
    version,
    about = "Two-phase provisioning with an enforced credential rotation boundary"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show what `apply` (or `destroy`) would change, without changing anything.
    Plan {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, value_enum, default_value_t = PhaseArg::All)]
        phase: PhaseArg,
        /// Plan a teardown instead of an apply.
        #[arg(long)]
        destroy: bool,
        #[command(flatten)]
        render: RenderFlags,
    },
    /// Create or update resources of the selected phases.
    Apply {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, value_enum, default_value_t = PhaseArg::All)]
        phase: PhaseArg,
        #[command(flatten)]
        render: RenderFlags,
        #[command(flatten)]
        exec: ExecFlags,
    },
    /// Issue fresh consume credentials and cross the rotation boundary.
    Rotate {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        render: RenderFlags,
        #[command(flatten)]
        exec: ExecFlags,
    },
    /// Tear down recorded resources in reverse dependency order.
    Destroy {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long, value_enum, default_value_t = PhaseArg::All)]
        phase: PhaseArg,
        #[command(flatten)]
        render: RenderFlags,
        #[command(flatten)]
        exec: ExecFlags,
    },
    /// Release a lock left behind by an interrupted run.
    Unlock {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long = "lock-id")]
        lock_id: String,
    },
}

#[derive(Debug, Clone, Args)]
struct TargetArgs {
    /// Manifest file or directory.
    #[arg(default_value = ".")]
    path: PathBuf,
    /// Config file; defaults to keystage.toml next to the manifests.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Execution record location.
    #[arg(long)]
    state: Option<PathBuf>,
    /// Log filter directives, e.g. `info` or `keystage_engine=debug`.
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-format", value_enum)]
    log_format: Option<LogFormatArg>,
}

#[derive(Debug, Clone, Copy, Args)]
struct RenderFlags {
    #[arg(long, value_enum, default_value_t = FormatArg::Text)]
    format: FormatArg,
    #[arg(long, value_enum, default_value_t = ColorArg::Auto)]
    color: ColorArg,
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, Args)]
struct ExecFlags {
    /// Maximum provider calls in flight.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Stop scheduling new nodes after the first failure.
    #[arg(long = "fail-fast")]
    fail_fast: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    Setup,
    Consume,
    All,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl RenderFlags {
    fn render_options(&self, target: &Path) -> RenderOptions {
        RenderOptions {
            color: self.color.into(),
            verbose: self.verbose,
            target: Some(target.display().to_string()),
        }
    }
}

impl ExecFlags {
    fn executor_options(&self, config: &Config) -> ExecutorOptions {
        let mut options = config.executor_options();
        if let Some(concurrency) = self.concurrency {
            options.concurrency = concurrency.max(1);
        }
        if self.fail_fast {
            options.fail_fast = true;
        }
        options
    }
}

impl From<PhaseArg> for PhaseSelection {
    fn from(value: PhaseArg) -> Self {
        match value {
            PhaseArg::Setup => Self::Setup,
            PhaseArg::Consume => Self::Consume,
            PhaseArg::All => Self::All,
        }
    }
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Text => Self::Text,
            FormatArg::Json => Self::Json,
        }
    }
}

impl From<ColorArg> for ColorChoice {
    fn from(value: ColorArg) -> Self {
        match value {
            ColorArg::Auto => Self::Auto,
            ColorArg::Always => Self::Always,
            ColorArg::Never => Self::Never,
        }
    }
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Mutation {
    Apply(PhaseSelection),
    Rotate,
    Destroy(PhaseSelection),
}

/// Config, logging and the execution record for one invocation.
struct Context {
    config: Config,
    store: FileStateStore,
}

impl Context {
    fn load(target: &TargetArgs) -> Result<Self, CliError> {
        let root = manifest_root(&target.path);
        let (config, config_path) = load_config(target.config.as_deref(), &root)?;

        let env_value = std::env::var(LOG_ENV).ok();
        let filter = log_filter(env_value.as_deref(), target.log_level.as_deref(), &config.log)?;
        init_logging(
            filter,
            target.log_format.map_or(config.log.format, Into::into),
        );
        if let Some(path) = &config_path {
            debug!(path = %path.display(), "using config file");
        }

        let state_path = target
            .state
            .clone()
            .unwrap_or_else(|| config.state_path(&root));
        debug!(path = %state_path.display(), "using execution record");
        Ok(Self {
            config,
            store: FileStateStore::new(state_path),
        })
    }
}

/// Run the CLI using process arguments.
///
/// Exit codes: `0` success, `1` failure, `2` for a plan with pending changes.
///
/// # Errors
///
/// Returns an error when argument parsing fails (excluding help/version) or
/// the command cannot run at all: unreadable manifests or config, a broken
/// dependency graph, a held lock, or a refused state transition.
pub fn run() -> std::result::Result<i32, CliError> {
    run_from(std::env::args_os())
}

fn run_from<I, T>(args: I) -> std::result::Result<i32, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(parsed) => parsed,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(error.into()),
        },
    };

    match cli.command {
        Commands::Plan {
            target,
            phase,
            destroy,
            render,
        } => run_plan(&target, phase.into(), destroy, render),
        Commands::Apply {
            target,
            phase,
            render,
            exec,
        } => run_mutation(&target, Mutation::Apply(phase.into()), render, exec),
        Commands::Rotate {
            target,
            render,
            exec,
        } => run_mutation(&target, Mutation::Rotate, render, exec),
        Commands::Destroy {
            target,
            phase,
            render,
            exec,
        } => run_mutation(&target, Mutation::Destroy(phase.into()), render, exec),
        Commands::Unlock { target, lock_id } => {
            let context = Context::load(&target)?;
            unlock(&context.store, &lock_id)?;
            eprintln!("released lock {lock_id}");
            Ok(0)
        }
    }
}

fn run_plan(
    target: &TargetArgs,
    selection: PhaseSelection,
    destroy: bool,
    render: RenderFlags,
) -> std::result::Result<i32, CliError> {
    let context = Context::load(target)?;
    let loaded = load_manifests(&target.path)?;
    let record = context.store.load()?;
    let mut sensitive_values = loaded.sensitive.clone();
    sensitive_values.extend(record.sensitive_values());

    let report = if destroy {
        build_destroy_plan(&record, selection.phases(), loaded.plan_context())
    } else {
        match loaded.graph() {
            Ok(graph) => {
                let sources = loaded.credential_sources();
                let registry = context.config.provider_registry();
                let executor = Executor::new(
                    &registry,
                    context.config.executor_options(),
                    CancelFlag::new(),
                );
                Workflow::new(&graph, &sources, &context.store, executor).plan(
                    selection,
                    false,
                    loaded.plan_context(),
                )?
            }
            Err(error) => unbuildable_plan(
                loaded.plan_context(),
                record.workflow,
                selection.phases(),
                &error,
            ),
        }
    };

    let render_options = render.render_options(&target.path);
    let output_format: OutputFormat = render.format.into();
    let rendered = render_plan(&report, output_format, &render_options)?;
    emit_output(&rendered, output_format, &sensitive_values);

    if report.has_errors() {
        return Ok(1);
    }
    let has_drift = report.has_drift();
    if has_drift && output_format == OutputFormat::Text {
        let command = if destroy { "destroy" } else { "apply" };
        eprintln!("hint: run `keystage {command}` to make these changes");
    }
    Ok(if has_drift { 2 } else { 0 })
}

fn run_mutation(
    target: &TargetArgs,
    mutation: Mutation,
    render: RenderFlags,
    exec: ExecFlags,
) -> std::result::Result<i32, CliError> {
    let context = Context::load(target)?;
    let loaded = load_manifests(&target.path)?;
    let graph = loaded.graph()?;
    let sources = loaded.credential_sources();
    let registry = context.config.provider_registry();

    let mut sensitive_values = loaded.sensitive.clone();
    sensitive_values.extend(context.store.load()?.sensitive_values());

    let cancel = CancelFlag::new();
    install_interrupt_handler(&cancel);
    let executor = Executor::new(&registry, exec.executor_options(&context.config), cancel);
    let workflow = Workflow::new(&graph, &sources, &context.store, executor)
        .with_lock_ttl(context.config.lock_ttl());

    let report = match mutation {
        Mutation::Apply(selection) => workflow.apply(selection)?,
        Mutation::Rotate => workflow.rotate()?,
        Mutation::Destroy(selection) => workflow.destroy(selection)?,
    };

    match context.store.load() {
        Ok(record) => sensitive_values.extend(record.sensitive_values()),
        Err(error) => warn!(%error, "could not reload execution record for redaction"),
    }

    let render_options = render.render_options(&target.path);
    let output_format: OutputFormat = render.format.into();
    let rendered = render_apply(&report, output_format, &render_options)?;
    emit_output(&rendered, output_format, &sensitive_values);
    Ok(i32::from(report.has_failures()))
}

fn install_interrupt_handler(cancel: &CancelFlag) {
    let flag = cancel.clone();
    if let Err(error) = ctrlc::set_handler(move || {
        if !flag.is_cancelled() {
            eprintln!("interrupted: stopping in-flight plugin calls and saving progress");
        }
        flag.cancel();
    }) {
        warn!(%error, "failed to install Ctrl-C handler");
    } else {
        info!("press Ctrl-C to stop; in-flight plugin calls are killed");
    }
}

fn emit_output(rendered: &str, format: OutputFormat, sensitive_values: &BTreeSet<String>) {
    let redacted = redact_sensitive(rendered, sensitive_values);

    if format == OutputFormat::Text && should_use_pager() && page_output(&redacted).is_ok() {
        return;
    }

    if redacted.ends_with('\n') {
        print!("{redacted}");
    } else {
        println!("{redacted}");
    }
}

fn should_use_pager() -> bool {
    std::io::stdout().is_terminal() && std::env::var_os("NO_PAGER").is_none()
}

fn page_output(rendered: &str) -> std::result::Result<(), minus::MinusError> {
    let pager = Pager::new();
    pager.set_exit_strategy(ExitStrategy::PagerQuit)?;
    pager.set_text(rendered)?;
    page_all(pager)
}
