use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

use contabot::bridge::PowerShellBridge;
use contabot::clock::SystemClock;
use contabot::config::{LayoutConfig, RunConfig, DEFAULT_FILES};
use contabot::data::pool::{DatabasePools, PoolSettings};
use contabot::data::sqlite::SqliteDataAccess;
use contabot::dialog::{classify, DialogEvent};
use contabot::environment::EnvironmentInfo;
use contabot::lifecycle::{ApplicationManager, SystemProcesses};
use contabot::matcher::{
    best_match, best_match_advanced, MatchOptions, Preprocess, TemplateLibrary, ADVANCED_CONFIDENCE,
};
use contabot::surface::UiSurface;
use contabot::workflow::login::login;
use contabot::workflow::run::Orchestrator;
use contabot::workflow::Desktop;

#[derive(Parser, Debug)]
#[command(
    name = "contabot",
    version,
    about = "Posts accounting entries in CONTPAQi Contabilidad by driving its windows"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Restart the application, sign in and post every configured company
    Run(RunArgs),
    /// Print the classification of a dialog as JSON
    Classify(ClassifyArgs),
    /// Match a template against a screenshot offline and print the result as JSON
    Match(MatchArgs),
    /// List top-level windows
    Windows,
    /// Print the installation info read from the registry as JSON
    Environment,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Configuration file; repeat to merge several (default: config.yaml filters.yaml)
    #[arg(long = "config")]
    configs: Vec<PathBuf>,
    /// Log at debug level
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,
    /// Print the run report as pretty JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Window title
    #[arg(long)]
    title: String,
    /// Message text shown in the window
    #[arg(long, default_value = "")]
    message: String,
}

#[derive(Args, Debug)]
struct MatchArgs {
    /// Screenshot PNG
    #[arg(long)]
    screen: PathBuf,
    /// Template PNG
    #[arg(long)]
    template: PathBuf,
    /// Minimum score for a hit
    #[arg(long)]
    confidence: Option<f32>,
    /// Try every preprocessing variant
    #[arg(long, action = ArgAction::SetTrue)]
    advanced: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let debug = matches!(&cli.command, Commands::Run(args) if args.debug);
    init_logging(debug);

    match cli.command {
        Commands::Run(args) => command_run(args),
        Commands::Classify(args) => command_classify(args),
        Commands::Match(args) => command_match(args),
        Commands::Windows => command_windows(),
        Commands::Environment => command_environment(),
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn command_run(args: RunArgs) -> Result<()> {
    let paths: Vec<PathBuf> = if args.configs.is_empty() {
        DEFAULT_FILES.iter().map(PathBuf::from).collect()
    } else {
        args.configs
    };
    let config = RunConfig::load(&paths).context("loading configuration")?;
    let environment = EnvironmentInfo::query().unwrap_or_else(|err| {
        log::warn!("registry not readable: {err}");
        EnvironmentInfo::default()
    });

    let executable = match config.application.executable.clone() {
        Some(path) => path,
        None => match environment.executable(&config.application.process_name) {
            Some(path) => path,
            None => bail!("no executable configured and none found in the registry"),
        },
    };
    let data_dir = match config.database.data_dir.clone().or(environment.data_directory.clone()) {
        Some(dir) => dir,
        None => bail!("no data directory configured and none found in the registry"),
    };

    let bridge = PowerShellBridge::install().context("installing the desktop helper")?;
    let clock = SystemClock;
    let processes = SystemProcesses::new();
    let manager =
        ApplicationManager::new(&processes, &bridge, &clock, &config.application, executable);
    let pid = manager.restart_application().context("starting the application")?;
    log::info!("application running as pid {pid}");

    let templates = TemplateLibrary::new(config.layout.template_dir.clone());
    let desktop = Desktop {
        ui: &bridge,
        screen: &bridge,
        pointer: &bridge,
        clock: &clock,
        templates: &templates,
        layout: &config.layout,
    };
    login(&desktop, &config.user, &config.password, config.application.login_wait())
        .context("signing in")?;

    let pools = DatabasePools::new(
        data_dir,
        PoolSettings {
            max_size: config.database.pool_size,
            acquire_timeout: Duration::from_secs(config.database.acquire_timeout_secs),
        },
    );
    let data = SqliteDataAccess::with_general_database(pools, &config.database.general_database);
    let report = Orchestrator::new(desktop, &data, &config).run();
    manager.shutdown();
    let report = report.context("processing companies")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

fn command_classify(args: ClassifyArgs) -> Result<()> {
    let verdict = classify(&DialogEvent::new(args.title, args.message), &LayoutConfig::default());
    println!("{}", serde_json::to_string(&verdict)?);
    Ok(())
}

fn load_gray(path: &Path) -> Result<image::GrayImage> {
    let img = image::open(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(img.to_luma8())
}

fn command_match(args: MatchArgs) -> Result<()> {
    let screen = load_gray(&args.screen)?;
    let template = load_gray(&args.template)?;
    let options = MatchOptions::default();
    let default_confidence = if args.advanced {
        ADVANCED_CONFIDENCE
    } else {
        options.confidence
    };
    let confidence = args.confidence.unwrap_or(default_confidence);
    let found = if args.advanced {
        best_match_advanced(&screen, &template)
    } else {
        best_match(&screen, &template, &options.scales(), Preprocess::Identity)
    };

    let payload = match found {
        Some(hit) => json!({
            "matched": hit.score >= confidence,
            "confidence": confidence,
            "best": hit,
            "center": hit.center(),
        }),
        None => json!({ "matched": false, "confidence": confidence, "best": null }),
    };
    println!("{}", serde_json::to_string(&payload)?);
    Ok(())
}

fn command_windows() -> Result<()> {
    let bridge = PowerShellBridge::install().context("installing the desktop helper")?;
    let windows = bridge.top_level_windows(None)?;
    println!("{}", serde_json::to_string_pretty(&json!({ "windows": windows }))?);
    Ok(())
}

fn command_environment() -> Result<()> {
    let info = EnvironmentInfo::query()?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
