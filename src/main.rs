use clap::{CommandFactory, Parser};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use engine_supervisor::cli::{Cli, Command, resolve_identity};
use engine_supervisor::config::{self, Config};
use engine_supervisor::engine::CommandEngine;
use engine_supervisor::log::{LogFileEntry, list_log_files};
use engine_supervisor::paths::Paths;
use engine_supervisor::supervisor::{EngineError, Supervisor};
use owo_colors::OwoColorize;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const MONITOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Run { config, identity }) => {
            let config = load(&config)?;
            let code = run(config, resolve_identity(identity), cli.json).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Some(Command::Describe { config }) => {
            let config = load(&config)?;
            let sup = Supervisor::new(
                CommandEngine::new(config.engine),
                resolve_identity(None),
                config.supervisor,
            );
            println!("{sup}");
        }
        Some(Command::Logs { config, identity }) => {
            let config = load(&config)?;
            let paths = Paths::from_env(
                config.supervisor.work_dir_root.as_deref(),
                &resolve_identity(identity),
            )?;
            let entries = list_log_files(paths.work_dir(), &config.engine.module)?;
            print_log_files(paths.work_dir(), &entries);
        }
        None => {
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

fn load(path: &Path) -> color_eyre::Result<Config> {
    config::load_config(path).map_err(|e| color_eyre::eyre::eyre!("{e}"))
}

/// Run the engine to completion. Returns the exit code to report.
async fn run(config: Config, identity: String, json: bool) -> color_eyre::Result<i32> {
    let sup = Supervisor::new(CommandEngine::new(config.engine), identity, config.supervisor);
    let handle = sup.start().await?;

    if let Some(log_file) = sup.log_file().await {
        eprintln!(
            "{} pid {} {} {}",
            "started".green(),
            handle.pid().map_or_else(|| "-".to_string(), |p| p.to_string()),
            "log:".dimmed(),
            log_file.display()
        );
    }

    let code = tokio::select! {
        code = handle.wait() => code,
        _ = tokio::signal::ctrl_c() => {
            handle.kill()?;
            handle.wait().await
        }
    };

    let result = match code {
        Some(0) => 0,
        other => {
            sup.wait_released(MONITOR_DRAIN_TIMEOUT).await;
            let err = sup.error().await;
            print_engine_error(&err, json)?;
            other.unwrap_or(1)
        }
    };

    sup.close().await;
    Ok(result)
}

fn print_engine_error(err: &EngineError, json: bool) -> color_eyre::Result<()> {
    if json {
        println!("{}", serde_json::to_string(err)?);
    } else {
        eprintln!("{} {}", "error:".red().bold(), err);
    }
    Ok(())
}

fn print_log_files(dir: &Path, entries: &[LogFileEntry]) {
    if entries.is_empty() {
        println!("{} {}", "no log files in".yellow(), dir.display());
        return;
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("index").add_attribute(Attribute::Bold),
        Cell::new("file").add_attribute(Attribute::Bold),
        Cell::new("size").add_attribute(Attribute::Bold),
        Cell::new("modified").add_attribute(Attribute::Bold),
    ]);
    for entry in entries {
        let name = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified = entry
            .modified
            .map(|t| {
                chrono::DateTime::<chrono::Local>::from(t)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(entry.index).fg(Color::Cyan),
            Cell::new(name),
            Cell::new(format_size(entry.len)),
            Cell::new(modified),
        ]);
    }
    println!("{table}");
}

fn format_size(bytes: u64) -> String {
    match bytes {
        b if b < 1024 => format!("{b}B"),
        b if b < 1024 * 1024 => format!("{:.1}K", b as f64 / 1024.0),
        b if b < 1024 * 1024 * 1024 => format!("{:.1}M", b as f64 / (1024.0 * 1024.0)),
        b => format!("{:.1}G", b as f64 / (1024.0 * 1024.0 * 1024.0)),
    }
}
