//! docshift CLI

use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use docshift::config::{LogFormat, LoggingConfig, SAMPLE_CONFIG};
use docshift::engine::{self, EntityJob};
use docshift::{BackupConfig, BackupEngine, BackupPhase, RunReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "docshift")]
#[command(author, version, about = "Back up MongoDB collections into PostgreSQL or DuckDB")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (overrides [logging] level)
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (overrides [logging] format)
    #[arg(long, value_enum, global = true, env = "LOG_FORMAT")]
    log_format: Option<LogFormatArg>,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup (default)
    Run {
        /// Back up independent entities concurrently
        #[arg(long)]
        parallel: bool,
        /// Only create or evolve tables
        #[arg(long)]
        dry_run: bool,
        /// Do not run migrations
        #[arg(long)]
        skip_migrations: bool,
        /// Do not run repair passes
        #[arg(long)]
        skip_repairs: bool,
    },
    /// Test connectivity
    Test,
    /// Print the DDL for an empty destination
    Plan,
    /// Show applied migrations
    Status,
    /// Generate sample config
    Init {
        #[arg(short, long, default_value = "docshift.toml")]
        output: String,
    },
    /// Base64-encode a config file for DOCSHIFT_CONFIG
    EncodeConfig {
        /// Input TOML file path
        #[arg(short, long, default_value = "docshift.toml")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let level = cli.log_level.as_deref();
    let format = cli.log_format.map(LogFormat::from);

    match cli.command {
        Some(Commands::Init { ref output }) => {
            init_logging(&LoggingConfig::default().with_overrides(level, format), &cli);
            return run_init(output);
        }
        Some(Commands::EncodeConfig { ref input }) => {
            init_logging(&LoggingConfig::default().with_overrides(level, format), &cli);
            return run_encode_config(input);
        }
        _ => {}
    }

    let (mut config, origin) = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_logging(&LoggingConfig::default().with_overrides(level, format), &cli);
            return Err(e);
        }
    };
    init_logging(&config.logging.with_overrides(level, format), &cli);
    info!("Loaded config from {}", origin);

    match cli.command {
        None => run_backup(config, cli.json, cli.quiet).await,
        Some(Commands::Run {
            parallel,
            dry_run,
            skip_migrations,
            skip_repairs,
        }) => {
            config.run.parallel |= parallel;
            config.run.dry_run |= dry_run;
            config.run.skip_migrations |= skip_migrations;
            config.run.skip_repairs |= skip_repairs;
            run_backup(config, cli.json, cli.quiet).await
        }
        Some(Commands::Test) => run_test(config, cli.json).await,
        Some(Commands::Plan) => run_plan(config, cli.json),
        Some(Commands::Status) => run_status(config, cli.json).await,
        Some(Commands::Init { .. }) | Some(Commands::EncodeConfig { .. }) => Ok(()),
    }
}

/// Config and where it came from. Runs before logging is installed.
fn load_config(
    path: Option<&str>,
) -> Result<(BackupConfig, String), Box<dyn std::error::Error>> {
    if let Some(p) = path {
        return Ok((BackupConfig::from_file(p)?, p.to_string()));
    }

    for default in ["docshift.toml", ".docshift.toml"] {
        if std::path::Path::new(default).exists() {
            return Ok((BackupConfig::from_file(default)?, default.to_string()));
        }
    }

    Ok((BackupConfig::from_env()?, "environment".to_string()))
}

async fn run_backup(
    config: BackupConfig,
    json: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !quiet && !json {
        println!("docshift v{}", docshift::VERSION);
        println!(
            "Target: {}  Entities: {}\n",
            config.sink.display_target(),
            config.entities.len()
        );
    }

    let mut engine = BackupEngine::from_config(&config).await?;

    let bar = if quiet || json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    };
    let progress = bar.clone();
    engine = engine.with_progress(move |p| {
        let msg = match p.phase {
            BackupPhase::Materializing => format!("{}: materializing", p.entity),
            BackupPhase::Copying => format!("{}: {} documents", p.entity, p.documents),
            BackupPhase::Completed => format!("{}: done ({} documents)", p.entity, p.documents),
            BackupPhase::Failed => format!("{}: failed after {} documents", p.entity, p.documents),
        };
        progress.set_message(msg);
    });

    let report = engine.run().await;
    bar.finish_and_clear();
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_report(&report);
    }

    if report.success {
        Ok(())
    } else {
        Err(report
            .error
            .unwrap_or_else(|| "Backup failed".to_string())
            .into())
    }
}

fn print_report(report: &RunReport) {
    if report.success {
        println!("{} Backup completed successfully", style("✓").green());
    } else {
        println!("{} Backup completed with errors", style("✗").red());
    }
    println!(
        "\nDuration: {}",
        humantime::format_duration(Duration::from_millis(report.duration_ms))
    );
    println!(
        "Rows: {} written, {} skipped, {} failed ({:.1} rows/s)",
        report.total_written(),
        report.total_skipped(),
        report.total_failed(),
        report.metrics.rows_per_second()
    );
    println!(
        "Entities: {:.0}% completed\n",
        report.metrics.success_rate() * 100.0
    );

    for m in report.materialized.iter().filter(|m| !m.is_noop()) {
        if m.created {
            println!("  {} created {}", style("+").green(), m.table);
        } else {
            println!(
                "  {} evolved {}: {}",
                style("~").yellow(),
                m.table,
                m.added_columns
                    .iter()
                    .chain(&m.added_constraints)
                    .chain(&m.added_indexes)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    for e in &report.entities {
        let icon = if e.success() {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!(
            "  {} {} → {}: {} written, {} skipped, {} failed ({}ms)",
            icon, e.entity, e.table, e.written, e.skipped, e.failed, e.duration_ms
        );
        for row_error in &e.errors {
            println!("      {}", style(row_error).dim());
        }
        if let Some(ref err) = e.error {
            println!("      Error: {}", err);
        }
    }

    if let Some(ref m) = report.migrations {
        println!(
            "\nMigrations: {} applied, {} already applied",
            m.applied.len(),
            m.skipped.len()
        );
    }
    for r in &report.repairs {
        println!(
            "Repair {}: {} written, {} skipped, {} failed",
            r.name, r.written, r.skipped, r.failed
        );
    }
}

async fn run_test(config: BackupConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !json {
        println!("Testing connectivity...\n");
    }

    let mut engine = BackupEngine::from_config(&config).await?;
    engine.test_connectivity().await?;

    if json {
        println!(r#"{{"source":"ok","sink":"ok"}}"#);
    } else {
        println!("\n{} All connectivity tests passed!", style("✓").green());
    }
    Ok(())
}

fn run_plan(config: BackupConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = config
        .entities
        .iter()
        .map(EntityJob::from_config)
        .collect::<docshift::Result<Vec<_>>>()?;
    let statements = engine::plan(
        engine::config_dialect(&config.sink),
        &jobs,
        &config.external_tables,
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statements)?);
    } else {
        for statement in &statements {
            println!("{};\n", statement);
        }
    }
    Ok(())
}

async fn run_status(config: BackupConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let engine = BackupEngine::from_config(&config).await?;
    let Some(history) = engine.migration_history().await? else {
        if json {
            println!("null");
        } else {
            println!("No migration history");
            println!("\nTotal: 0 applied, {} pending", config.migrations.len());
        }
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        println!("Applied Migrations\n");
        for m in &history {
            println!("  {}  {}", m.applied_at, m.name);
        }
        let pending: Vec<&str> = config
            .migrations
            .iter()
            .map(|m| m.name.as_str())
            .filter(|name| !history.iter().any(|h| h.name == *name))
            .collect();
        println!("\nTotal: {} applied, {} pending", history.len(), pending.len());
        for name in pending {
            println!("  pending: {}", name);
        }
    }
    Ok(())
}

fn run_encode_config(input: &str) -> Result<(), Box<dyn std::error::Error>> {
    use base64::{Engine, engine::general_purpose::STANDARD};

    let content =
        std::fs::read_to_string(input).map_err(|e| format!("Failed to read {}: {}", input, e))?;
    BackupConfig::from_toml(&content).map_err(|e| format!("Invalid config in {}: {}", input, e))?;

    let encoded = STANDARD.encode(content.as_bytes());

    println!("=== DOCSHIFT_CONFIG ===\n");
    println!("{}\n", encoded);
    println!("Export it as DOCSHIFT_CONFIG to run without a config file.");
    Ok(())
}

fn run_init(output: &str) -> Result<(), Box<dyn std::error::Error>> {
    if std::path::Path::new(output).exists() {
        return Err(format!("{} already exists", output).into());
    }
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("{} Created: {}", style("✓").green(), output);
    println!("\nEdit the file or use environment variables:");
    println!("  MONGO_URL, MONGO_DATABASE, DATABASE_URL, DOCSHIFT_ENTITIES_JSON");
    Ok(())
}

/// Install the subscriber. `RUST_LOG` wins over the resolved level.
fn init_logging(logging: &LoggingConfig, cli: &Cli) {
    if cli.quiet {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // With JSON output on stdout, logs go to stderr
    match (logging.format, cli.json) {
        (LogFormat::Json, _) => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        (LogFormat::Text, true) => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        (LogFormat::Text, false) => fmt().with_env_filter(filter).with_target(false).init(),
    }
}
