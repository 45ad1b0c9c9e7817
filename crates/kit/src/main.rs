//! vmseed - configure a fresh VM over its serial console, exactly once.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::Context as _, Result};
use serde::Serialize;

mod boot;
mod bundle;
mod command_run;
mod common_opts;
mod console;
mod error;
mod gate;
mod image;
mod qemu;
mod remote;
mod script;
mod supervisor;
mod transport;
mod utils;

use common_opts::{BundleOpts, StateOpts};
use gate::{CompletionRecord, InitState};
use supervisor::BootstrapOutcome;

/// Inject first-boot configuration into a VM through its serial console.
///
/// The VM has no network or SSH access at first start. vmseed waits for the
/// console to become interactive, streams a configuration bundle through it,
/// runs the bundled units and records completion so later starts skip the
/// whole exchange.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
struct PackageOpts {
    #[clap(flatten)]
    bundle: BundleOpts,

    /// Directory to write the console segments into
    #[clap(long)]
    output: Utf8PathBuf,
}

#[derive(Parser)]
struct StatusOpts {
    #[clap(flatten)]
    state: StateOpts,

    /// Print machine-readable JSON
    #[clap(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the VM, configure it on first start, then keep it running
    Run(supervisor::RunOpts),

    /// Configure a VM through an existing console socket
    Bootstrap(supervisor::BootstrapOpts),

    /// Write the console segments of a bundle to a directory without sending them
    Package(PackageOpts),

    /// Show whether the VM has been configured
    Status(StatusOpts),
}

#[derive(Serialize)]
struct StatusReport<'a> {
    state_file: &'a Utf8PathBuf,
    initialized: bool,
    record: Option<CompletionRecord>,
}

fn status(opts: &StatusOpts) -> Result<()> {
    let state = opts.state.gate().state()?;
    let (initialized, record) = match state {
        InitState::Uninitialized => (false, None),
        InitState::Initialized(record) => (true, record),
    };
    if opts.json {
        let report = StatusReport {
            state_file: &opts.state.state_file,
            initialized,
            record,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if !initialized {
        println!("uninitialized ({} absent)", opts.state.state_file);
        return Ok(());
    }
    println!("initialized ({})", opts.state.state_file);
    if let Some(record) = record {
        println!("created_at: {}", record.created_at);
        for unit in record.units {
            println!("  {unit}");
        }
    }
    Ok(())
}

fn package(opts: &PackageOpts) -> Result<()> {
    let payload = bundle::package(&opts.bundle.sources()?, &opts.bundle.contract())?;
    payload.write_to(&opts.output)?;
    println!(
        "Wrote {} units ({} bytes) to {}",
        payload.manifest.len(),
        payload.len(),
        opts.output
    );
    Ok(())
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info',
/// and always go to stderr; stdout is left to the VM console in `run` mode.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Dispatch a parsed command line; returns the process exit code.
fn run(cli: Cli) -> Result<i32> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Init tokio runtime")?;

    let code = match cli.command {
        Commands::Run(opts) => rt.block_on(supervisor::run(&opts))?,
        Commands::Bootstrap(opts) => {
            match rt.block_on(supervisor::bootstrap(&opts))? {
                BootstrapOutcome::Skipped => println!("Already initialized"),
                BootstrapOutcome::Completed { units } => {
                    println!("Initialized ({} units)", units.len())
                }
            }
            0
        }
        Commands::Package(opts) => {
            package(&opts)?;
            0
        }
        Commands::Status(opts) => {
            status(&opts)?;
            0
        }
    };
    tracing::debug!("exiting");
    // Ensure we don't block on any spawned tasks
    rt.shutdown_background();
    Ok(code)
}

fn main() {
    install_tracing();
    if let Err(e) = color_eyre::install() {
        eprintln!("Failed to install error handler: {e}");
    }

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            error::exit_code_for(&e)
        }
    };
    std::process::exit(code)
}
