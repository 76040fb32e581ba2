//! Test management tool.
//!
//! Runs plans from a metadata tree through discover, provision, prepare,
//! execute, report and finish, keeping every step's state in a resumable
//! workdir.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use tmt::core::environment::{self, Environment};
use tmt::core::step_name::StepName;
use tmt::error::{ErrorKind, kind_of};
use tmt::fmf;
use tmt::io::{cancel, config};
use tmt::io::output::Printer;
use tmt::metadata::{self, ObjectKind};
use tmt::options::RunOptions;
use tmt::steps::registry::{PLUGINS_ENV, scan_plugin_dirs};
use tmt::{exit_codes, logging, run};

#[derive(Parser)]
#[command(
    name = "tmt",
    version,
    about = "Test management tool: discover, provision, prepare, execute, report, finish"
)]
struct Cli {
    /// Metadata tree root (or any directory below it).
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Show more details (stackable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Diagnostic logging level (stackable, `TMT_DEBUG` overrides).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    debug: u8,

    /// Print only warnings, errors and results.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Start steps over even if they are done.
    #[arg(short, long, global = true)]
    force: bool,

    /// Show what would be done without doing it.
    #[arg(short = 'n', long, global = true)]
    dry: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run plans through the pipeline.
    Run(RunArgs),
    /// Inspect tests.
    Test {
        #[command(subcommand)]
        action: ObjectAction,
    },
    /// Inspect plans.
    Plan {
        #[command(subcommand)]
        action: ObjectAction,
    },
    /// Inspect stories.
    Story {
        #[command(subcommand)]
        action: ObjectAction,
    },
    /// Create `.fmf/version` to mark a metadata tree root.
    Init,
}

#[derive(Subcommand)]
enum ObjectAction {
    /// List object names.
    Ls(Selection),
    /// Show object details.
    Show(Selection),
}

#[derive(Args)]
struct Selection {
    /// Name regular expressions.
    names: Vec<String>,
    /// Advanced filter (`tag: smoke & tier: 1`).
    #[arg(short = 'F', long)]
    filter: Vec<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Run number or workdir path to create or resume.
    #[arg(short, long)]
    id: Option<String>,

    /// Enable every step.
    #[arg(short, long)]
    all: bool,

    /// Enable steps from this one on.
    #[arg(long)]
    since: Option<StepName>,

    /// Enable steps up to this one.
    #[arg(long)]
    until: Option<StepName>,

    /// Disable a step.
    #[arg(long)]
    skip: Vec<StepName>,

    /// Run-level environment `KEY=VALUE`, overrides plan environment.
    #[arg(short, long = "environment")]
    environment: Vec<String>,

    /// Delete the workdir after a successful run.
    #[arg(long)]
    remove: bool,

    /// Steps with their options, `plan --name`, `test --name/--filter`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    sections: Vec<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            Printer::new(0, false).error(&format!("{err:#}"));
            let code = match kind_of(&err) {
                ErrorKind::Interrupted => exit_codes::INTERRUPTED,
                _ => exit_codes::ERROR,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.debug);
    let printer = Printer::new(cli.verbose, cli.quiet);
    let ignored = scan_plugin_dirs(std::env::var(PLUGINS_ENV).ok().as_deref())?;
    for path in ignored {
        printer.warn(&format!("ignoring plugin {}", path.display()));
    }

    match cli.command {
        Command::Run(args) => {
            cancel::install_handler()?;
            let options = run_options(&cli.root, cli.force, cli.dry, args)?;
            let config = config::load_default().context("load tool configuration")?;
            let outcome = run::run(&options, &config, printer)?;
            Ok(outcome.exit_code)
        }
        Command::Test { action } => objects(&cli.root, ObjectKind::Test, action, &printer),
        Command::Plan { action } => objects(&cli.root, ObjectKind::Plan, action, &printer),
        Command::Story { action } => objects(&cli.root, ObjectKind::Story, action, &printer),
        Command::Init => {
            if fmf::init_tree(&cli.root)? {
                printer.info("initialized", &cli.root.join(fmf::VERSION_FILE).display().to_string(), 0);
            } else {
                printer.info("tree root already exists", &cli.root.display().to_string(), 0);
            }
            Ok(exit_codes::OK)
        }
    }
}

fn run_options(root: &std::path::Path, force: bool, dry: bool, args: RunArgs) -> Result<RunOptions> {
    let mut environment = Environment::new();
    for raw in &args.environment {
        let (key, value) = environment::parse_assignment(raw)?;
        environment.insert(key, value);
    }
    let mut options = RunOptions {
        id: args.id,
        all: args.all,
        since: args.since,
        until: args.until,
        skip: args.skip,
        force,
        dry,
        remove: args.remove,
        environment,
        ..RunOptions::new(root)
    };
    options.apply_sections(&args.sections)?;
    Ok(options)
}

fn objects(root: &std::path::Path, kind: ObjectKind, action: ObjectAction, printer: &Printer) -> Result<i32> {
    let tree = metadata::load_tree(root)?;
    match action {
        ObjectAction::Ls(selection) => {
            let nodes = metadata::select(&tree, kind, &selection.names, &selection.filter)?;
            metadata::ls(&nodes, printer);
        }
        ObjectAction::Show(selection) => {
            let nodes = metadata::select(&tree, kind, &selection.names, &selection.filter)?;
            metadata::show(&nodes, printer);
        }
    }
    Ok(exit_codes::OK)
}
