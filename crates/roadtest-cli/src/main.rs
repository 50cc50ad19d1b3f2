//! roadtest: test-run orchestrator for mobile application builds.
//!
//! Scaffolds a disposable app project, builds and launches it, waits for the
//! on-device test suite to report back, and tears everything down.
//!
//! # Usage
//!
//! ```bash
//! # Run the suite on a local Android emulator
//! roadtest android
//!
//! # Build only, no device wait
//! roadtest ios --build-only
//!
//! # Run on a cloud-hosted device (needs ROADTEST_CLOUD_USER / ROADTEST_CLOUD_KEY)
//! roadtest android --remote --hub-url https://hub.example.com/wd/hub \
//!     --storage-url https://storage.example.com/v1
//!
//! # Keep the project around after a failing run for inspection
//! roadtest android --keep-on-failure
//!
//! # Machine-readable outcome
//! roadtest android --format json
//! ```
//!
//! Cloud endpoints can also be persisted in `~/.roadtest/config.json` so
//! remote runs only need `--remote`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roadtest_core::context::{
    CloudCredentials, ConfigError, ExecMode, ExecutionContext, Platform,
};
use roadtest_core::orchestrator::{Orchestrator, TestOutcome};
use roadtest_core::remote::{CloudConfig, RestDeviceCloud};
use roadtest_core::settings::{logs_dir, Settings};

/// Orchestrate one mobile app test run from scaffold to teardown.
#[derive(Parser)]
#[command(name = "roadtest")]
#[command(about = "Build a mobile app, run its test suite on a device, and report pass/fail")]
#[command(version)]
struct Cli {
    /// Target platform
    #[arg(value_enum)]
    platform: PlatformArg,

    /// Build the app and report success without waiting for a device
    #[arg(long)]
    build_only: bool,

    /// Run on a cloud-hosted remote device instead of a local one
    #[arg(long)]
    remote: bool,

    /// Event server port (0 picks an ephemeral port)
    #[arg(long, env = "ROADTEST_PORT")]
    port: Option<u16>,

    /// Externally reachable URL base for the event server (e.g. a tunnel)
    #[arg(long, env = "ROADTEST_EXTERNAL_URL")]
    external_url: Option<String>,

    /// Seconds to wait for the device to connect back
    #[arg(long, default_value_t = 300, env = "ROADTEST_CONNECTION_TIMEOUT")]
    connection_timeout: u64,

    /// Overall run timeout in seconds
    #[arg(long, default_value_t = 900, env = "ROADTEST_RUN_TIMEOUT")]
    run_timeout: u64,

    /// Keep the scaffolded project after a passing run
    #[arg(long)]
    keep_on_success: bool,

    /// Keep the scaffolded project after a failing run
    #[arg(long)]
    keep_on_failure: bool,

    /// Directory in which to scaffold the disposable project
    #[arg(short = 'C', long, default_value = ".")]
    workspace: PathBuf,

    /// Application identifier used for scaffolding and cloud capabilities
    #[arg(long, default_value = "io.roadtest.app")]
    app_id: String,

    /// Build tool program
    #[arg(long, default_value = "cordova", env = "ROADTEST_TOOL")]
    tool: String,

    /// Device cloud hub URL (remote mode)
    #[arg(long, env = "ROADTEST_HUB_URL")]
    hub_url: Option<String>,

    /// Device cloud storage URL (remote mode)
    #[arg(long, env = "ROADTEST_STORAGE_URL")]
    storage_url: Option<String>,

    /// Output format for the final outcome
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Stream build tool output instead of capturing it
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to ~/.roadtest/logs/ instead of stderr
    #[arg(long)]
    log_file: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PlatformArg {
    Android,
    Ios,
    Browser,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Android => Platform::Android,
            PlatformArg::Ios => Platform::Ios,
            PlatformArg::Browser => Platform::Browser,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_file);

    let settings = Settings::load();

    let mode = match ExecMode::resolve(cli.build_only, cli.remote) {
        Ok(mode) => mode,
        Err(e) => return fail(&e.to_string(), cli.format),
    };

    let mut context = ExecutionContext::new(cli.platform.into(), mode, cli.workspace);
    context.port = cli.port.or(settings.default_port).unwrap_or(context.port);
    context.external_url = cli.external_url;
    context.connection_timeout = Duration::from_secs(cli.connection_timeout);
    context.run_timeout = Duration::from_secs(cli.run_timeout);
    context.cleanup_on_success = !cli.keep_on_success;
    context.cleanup_on_failure = !cli.keep_on_failure;
    context.credentials = CloudCredentials::from_env();
    context.app_id = cli.app_id;
    context.build_tool = cli.tool;
    context.verbose = cli.verbose;

    let orchestrator = if mode == ExecMode::RunRemote {
        let credentials = match context.credentials.clone() {
            Some(credentials) => credentials,
            None => return fail(&ConfigError::MissingCredentials.to_string(), cli.format),
        };
        let hub_url = cli.hub_url.or(settings.hub_url);
        let storage_url = cli.storage_url.or(settings.storage_url);
        match (hub_url, storage_url) {
            (Some(hub_url), Some(storage_url)) => {
                let cloud = RestDeviceCloud::new(CloudConfig {
                    hub_url,
                    storage_url,
                    credentials,
                });
                Orchestrator::with_cloud(context, Arc::new(cloud))
            }
            _ => return fail(&ConfigError::MissingCloudConfig.to_string(), cli.format),
        }
    } else {
        Orchestrator::new(context)
    };

    match orchestrator.run().await {
        Ok(outcome) => {
            print_outcome(&outcome, cli.format);
            if outcome.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => fail(&e.to_string(), cli.format),
    }
}

fn init_tracing(log_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_file {
        let filename = format!(
            "roadtest_{}.log",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        );
        let appender = tracing_appender::rolling::never(logs_dir(), filename);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(appender)
            .with_ansi(false)
            .init();
        info!("logging to {}", logs_dir().display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_outcome(outcome: &TestOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            let verdict = if outcome.passed { "PASSED" } else { "FAILED" };
            println!("result: {} ({} failed specs)", verdict, outcome.spec_failed);
        }
        OutputFormat::Json => match serde_json::to_string(outcome) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("error: failed to encode outcome: {}", e),
        },
    }
}

fn fail(message: &str, format: OutputFormat) -> ExitCode {
    match format {
        OutputFormat::Text => eprintln!("error: {}", message),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "error": message }));
        }
    }
    ExitCode::FAILURE
}
