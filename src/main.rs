//! xcfleet CLI - Distributed XCTest runner.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use xcfleet::config::{self, Config};
use xcfleet::orchestrator::Orchestrator;
use xcfleet::orchestrator::artifact::FINAL_DIR;
use xcfleet::plan::{self, XcTestRun};
use xcfleet::report::{ConsoleReporter, JUnitReporter, MultiReporter, SummaryReporter};
use xcfleet::shutdown::install_shutdown_handler;
use xcfleet::transport::local::LocalSession;
use xcfleet::transport::ssh::SshTransport;

#[derive(Parser)]
#[command(name = "xcfleet")]
#[command(about = "Distributed XCTest runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "xcfleet.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests across the fleet
    Run {
        /// Run only this test identifier (repeatable)
        #[arg(long = "only-testing", value_name = "ID")]
        only_testing: Vec<String>,

        /// File with one test identifier per line
        #[arg(long)]
        tests_file: Option<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Enumerate tests without running them
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Path to the .xctestrun produced by build-for-testing
        #[arg(short, long, default_value = "build/Tests.xctestrun")]
        xctestrun: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            only_testing,
            tests_file,
            junit,
        } => run_tests(&cli.config, only_testing, tests_file, junit, cli.verbose).await,
        Commands::List { format } => list_tests(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { xctestrun } => init_config(&xctestrun),
    }
}

async fn run_tests(
    config_path: &Path,
    only_testing: Vec<String>,
    tests_file: Option<PathBuf>,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let plan = load_plan(&config).await?;
    let tests = if only_testing.is_empty() {
        resolve_tests(&config, &plan, tests_file).await?
    } else {
        only_testing
    };
    info!("{} tests selected", tests.len());

    let reporter = create_reporter(&config, junit_path, verbose);
    let cancel = install_shutdown_handler();

    let orchestrator = Orchestrator::new(config, SshTransport::new(), reporter);
    let result = orchestrator.run(tests, &plan, cancel).await?;

    std::process::exit(result.exit_code());
}

async fn list_tests(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let plan = load_plan(&config).await?;
    let tests = resolve_tests(&config, &plan, None).await?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        _ => {
            println!("Found {} tests:", tests.len());
            for test in &tests {
                println!("  {}", test);
            }
        }
    }

    Ok(())
}

async fn load_plan(config: &Config) -> Result<XcTestRun> {
    XcTestRun::load(
        &LocalSession::new(),
        &config.run.xctestrun_path,
        config.run.only_test_configuration.clone(),
    )
    .await
    .with_context(|| {
        format!(
            "Failed to load test plan {}",
            config.run.xctestrun_path.display()
        )
    })
}

/// An explicit test list wins over enumeration from the test bundles.
async fn resolve_tests(
    config: &Config,
    plan: &XcTestRun,
    tests_file: Option<PathBuf>,
) -> Result<Vec<String>> {
    if let Some(path) = tests_file.or_else(|| config.run.tests_path.clone()) {
        return plan::read_test_list(&path).await;
    }

    let tests = plan::dump_tests(&LocalSession::new(), plan).await?;
    Ok(plan::filter_tests(
        tests,
        &plan.only_test_ids(),
        &plan.skip_test_ids(),
    ))
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Test plan: {}", config.run.xctestrun_path.display());
            println!("  Output dir: {}", config.run.output_dir.display());
            println!("  Rerun limit: {}", config.run.rerun_limit);
            println!("  Bucket size: {}", config.run.bucket_size);
            println!(
                "  Execution timeout: {}s",
                config.run.execution_timeout_secs
            );
            match config.run.global_timeout_secs {
                Some(secs) => println!("  Global timeout: {}s", secs),
                None => println!("  Global timeout: none"),
            }

            println!();
            println!("Nodes:");
            for node in &config.nodes {
                println!(
                    "  {} ({}@{}:{}): {} simulator(s), {} device(s), {} mac(s)",
                    node.name,
                    node.username,
                    node.host,
                    node.port,
                    node.targets.simulators.len(),
                    node.targets.devices.len(),
                    node.targets.mac.len()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(xctestrun: &str) -> Result<()> {
    let config = format!(
        r#"# xcfleet configuration file

[run]
xctestrun_path = "{}"
output_dir = "results"
rerun_limit = 1
bucket_size = 1
execution_timeout_secs = 300

[[nodes]]
name = "mini-1"
host = "10.0.0.5"
username = "ci"
private_key = "~/.ssh/id_ed25519"
deployment_path = "/Users/ci/xcfleet"
xcode_path = "/Applications/Xcode.app"

[nodes.targets]
simulators = []
devices = []

[report]
junit = true
junit_file = "final_result.xml"
summary_file = "final_result.txt"
"#,
        xctestrun
    );

    let path = PathBuf::from("xcfleet.toml");
    if path.exists() {
        eprintln!("xcfleet.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created xcfleet.toml");
    println!();
    println!("Declare at least one simulator or device per node, then run:");
    println!("  xcfleet run");

    Ok(())
}

fn create_reporter(
    config: &Config,
    junit_override: Option<PathBuf>,
    verbose: bool,
) -> MultiReporter {
    let final_dir = config.run.output_dir.join(FINAL_DIR);
    let mut multi = MultiReporter::new();

    // Add console reporter
    multi = multi.with_reporter(ConsoleReporter::new(verbose));
    multi = multi.with_reporter(SummaryReporter::new(
        final_dir.join(&config.report.summary_file),
    ));

    // Add JUnit reporter if enabled
    if config.report.junit {
        let junit_path = junit_override.unwrap_or_else(|| final_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    multi
}
