use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use tracing_subscriber::EnvFilter;

use conveyor_config::Settings;
use conveyor_core::{JobParams, JobType, TaskState, CONVEYOR_CONFIG_VAR, CONVEYOR_LOG_VAR};
use conveyor_manager::{tail_log, TaskManager};
use conveyor_workspace::{read_status, status_path, Workspace};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Declarative task orchestrator for pipeline jobs", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job, wait for it, and print the result
    Run {
        /// Job type: convert, report, or bundle
        job_type: String,

        /// Job parameter as key=value (can be specified multiple times)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// Print the durable status file of a task workspace
    Status {
        /// Task workspace directory
        workspace: PathBuf,
    },
    /// Run one retention sweep over the tasks root
    Sweep,
    /// Print the most recent audit log entries
    Audit {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        lines: usize,
    },
}

fn load_settings(config: Option<&PathBuf>) -> eyre::Result<Settings> {
    let path = config
        .cloned()
        .or_else(|| std::env::var(CONVEYOR_CONFIG_VAR).ok().map(PathBuf::from));
    match path {
        Some(path) => Settings::load(&path)
            .wrap_err_with(|| format!("loading configuration from {}", path.display())),
        None => Settings::from_env().wrap_err("loading configuration from environment"),
    }
}

fn parse_params(pairs: &[String]) -> eyre::Result<JobParams> {
    let mut params = JobParams::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("parameter '{pair}' is not of the form key=value");
        };
        params.insert(key, value);
    }
    Ok(params)
}

async fn run_job(settings: Settings, job_type: &str, raw_params: &[String]) -> eyre::Result<()> {
    let job_type = JobType::parse(job_type)?;
    let params = parse_params(raw_params)?;

    let manager = TaskManager::new(settings)?;
    let id = manager.submit(job_type, params).await?;
    println!("task {id} submitted");

    let view = manager.wait(id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);

    match view.state {
        TaskState::Completed => Ok(()),
        state => bail!("task {id} ended as {state}"),
    }
}

async fn sweep(settings: Settings) -> eyre::Result<()> {
    let manager = TaskManager::new(settings)?;
    let report = manager.sweep(chrono::Utc::now()).await?;
    println!(
        "removed {} workspace(s), skipped {} non-terminal",
        report.removed.len(),
        report.skipped_non_terminal.len()
    );
    Ok(())
}

fn show_status(workspace: &PathBuf) -> eyre::Result<()> {
    let workspace = Workspace::at(workspace.clone());
    let status = read_status(&status_path(&workspace))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn show_audit(settings: &Settings, lines: usize) -> eyre::Result<()> {
    for line in tail_log(&settings.audit.path, lines)? {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env(CONVEYOR_LOG_VAR).unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Run { job_type, params } => run_job(settings, &job_type, &params).await,
        Commands::Status { workspace } => show_status(&workspace),
        Commands::Sweep => sweep(settings).await,
        Commands::Audit { lines } => show_audit(&settings, lines),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_parse() {
        let params = parse_params(&["text=hello".into(), "name=out".into()]).unwrap();
        assert_eq!(params.get("text"), Some("hello"));
        assert_eq!(params.get("name"), Some("out"));
    }

    #[test]
    fn malformed_pair_is_rejected() {
        assert!(parse_params(&["no-equals".into()]).is_err());
    }

    #[test]
    fn cli_parses_run_with_params() {
        let cli = Cli::try_parse_from([
            "conveyor", "run", "convert", "-p", "text=hi", "-p", "name=out",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { job_type, params } => {
                assert_eq!(job_type, "convert");
                assert_eq!(params.len(), 2);
            }
            _ => panic!("expected run command"),
        }
    }
}
