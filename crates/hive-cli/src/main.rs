//! hive: Hierarchical Agent Orchestration CLI
//!
//! Runs scripted workflows through the orchestration core.
//!
//! Usage:
//!   hive run <script.toml>               - Run a workflow script
//!   hive resume <script.toml> <run-id>   - Resume a checkpointed run
//!   hive validate <script.toml>          - Check a script without running it
//!   hive --help                          - Show help

mod report;
mod script;

use std::path::PathBuf;

use hive_core::{Config, WorkflowCoordinator, control_channel};
use tracing_subscriber::EnvFilter;

use script::Script;

/// Options shared by `run` and `resume`
#[derive(Debug, Default, PartialEq)]
struct RunOptions {
    config: Option<PathBuf>,
    verbose: bool,
    json: bool,
}

/// Run mode
#[derive(Debug, PartialEq)]
enum RunMode {
    /// Run a workflow script
    Run { script: PathBuf, options: RunOptions },
    /// Resume a checkpointed run
    Resume {
        script: PathBuf,
        run_id: String,
        options: RunOptions,
    },
    /// Validate a workflow script
    Validate { script: PathBuf },
    /// Show help
    Help,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = match parse_args(&args) {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("❌ {}", message);
            eprintln!("hive --help で使い方を表示します");
            std::process::exit(2);
        }
    };

    match mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("hive {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    let code = match mode {
        RunMode::Validate { script } => run_validate(script)?,
        RunMode::Run { script, options } => run_workflow(script, None, options).await?,
        RunMode::Resume {
            script,
            run_id,
            options,
        } => run_workflow(script, Some(run_id), options).await?,
        _ => 0,
    };

    std::process::exit(code);
}

/// Parse command line arguments (without the program name)
fn parse_args(args: &[String]) -> Result<RunMode, String> {
    let mut positional = Vec::new();
    let mut options = RunOptions::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(RunMode::Help),
            "--version" | "-V" => return Ok(RunMode::Version),
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| "--config にはパスが必要です".to_string())?;
                options.config = Some(PathBuf::from(path));
            }
            "--verbose" | "-v" => options.verbose = true,
            "--json" => options.json = true,
            flag if flag.starts_with('-') => {
                return Err(format!("不明なオプション: {}", flag));
            }
            value => positional.push(value.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next() {
        Some(command) => command,
        None => return Ok(RunMode::Help),
    };
    let script = positional
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| format!("{} にはスクリプトのパスが必要です", command))?;

    let mode = match command.as_str() {
        "run" => RunMode::Run { script, options },
        "validate" => RunMode::Validate { script },
        "resume" => {
            let run_id = positional
                .next()
                .ok_or_else(|| "resume には run-id が必要です".to_string())?;
            RunMode::Resume {
                script,
                run_id,
                options,
            }
        }
        other => return Err(format!("不明なコマンド: {}", other)),
    };

    if let Some(extra) = positional.next() {
        return Err(format!("余分な引数: {}", extra));
    }
    Ok(mode)
}

/// Variables read by `Config::load`
const ENV_VARS: &[(&str, &str)] = &[
    ("HIVE_MAX_IN_FLIGHT", "Maximum concurrently executing tasks"),
    ("HIVE_PER_AGENT_CONCURRENCY", "Maximum executing tasks per agent"),
    ("HIVE_DEFAULT_MAX_RETRIES", "Retry budget of root tasks"),
    ("HIVE_RETRY_BACKOFF_MS", "Delay before each retry"),
    ("HIVE_MAX_REPLANS", "Re-decisions after failed children"),
    ("HIVE_MEMORY_RECALL_LIMIT", "Memory entries recalled per task"),
    ("HIVE_CHECKPOINT_ENABLED", "Persist task records after every round"),
    ("HIVE_CHECKPOINT_DB", "Checkpoint SQLite file"),
    ("HIVE_MEMORY_ENABLED", "Shared agent memory"),
    ("HIVE_MEMORY_DB", "Memory SQLite file"),
];

/// Print help message
fn print_help() {
    println!("hive - Hierarchical Agent Orchestration");
    println!();
    println!("Usage:");
    println!("  hive run <script.toml>               Run a workflow script");
    println!("  hive resume <script.toml> <run-id>   Resume a checkpointed run");
    println!("  hive validate <script.toml>          Check a script without running it");
    println!("  hive --help                          Show this help message");
    println!("  hive --version                       Show version");
    println!();
    println!("Options:");
    println!("  -c, --config <hive.toml>   Configuration file (default: ./hive.toml)");
    println!("  -v, --verbose              Print the task tree and dispatch order");
    println!("      --json                 Print the run report as JSON");
    println!();
    println!("Exit codes:");
    println!("  0 completed, 1 failed, 130 cancelled, 2 bad arguments");
    println!();
    println!("Environment Variables:");
    for (name, description) in ENV_VARS {
        println!("  {:<28}{}", name, description);
    }
    println!("  {:<28}{}", "RUST_LOG", "Log filter (default: info)");
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_toml_file(path),
        None => Config::load(),
    };
    config.map_err(|e| anyhow::anyhow!("Config error: {}", e))
}

fn run_validate(path: PathBuf) -> anyhow::Result<i32> {
    let script = Script::from_file(&path)?;
    match script.validate() {
        Ok(()) => {
            println!(
                "✅ {} ({} agents, {} tasks)",
                path.display(),
                script.workflow.agents.len(),
                script.workflow.tasks.len()
            );
            Ok(0)
        }
        Err(e) => {
            eprintln!("❌ {}: {}", path.display(), e);
            Ok(1)
        }
    }
}

async fn run_workflow(
    path: PathBuf,
    resume_from: Option<String>,
    options: RunOptions,
) -> anyhow::Result<i32> {
    let config = load_config(options.config.as_ref())?;
    let script = Script::from_file(&path)?;

    tracing::info!(
        "Loaded {} ({} agents, {} models, {} tools)",
        path.display(),
        script.workflow.agents.len(),
        script.models.len(),
        script.tools.len()
    );

    let coordinator = WorkflowCoordinator::from_config(config, script.models(), script.tools())?;

    let (handle, control) = control_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling workflow");
            handle.cancel();
        }
    });

    let report = match resume_from {
        None => coordinator.run_controlled(&script.workflow, control).await?,
        Some(run_id) => {
            let store = coordinator.checkpoint().ok_or_else(|| {
                anyhow::anyhow!("resume にはチェックポイントの有効化が必要です")
            })?;
            let records = store.load_run(&run_id)?;
            if records.is_empty() {
                anyhow::bail!("run {} のチェックポイントが見つかりません", run_id);
            }
            coordinator
                .resume_controlled(&script.workflow, &run_id, &records, control)
                .await?
        }
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report::render(&report, options.verbose));
    }

    Ok(report::exit_code(&report.outcome))
}
