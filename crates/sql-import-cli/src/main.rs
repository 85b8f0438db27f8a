//! sql-import CLI.

use clap::{Parser, Subcommand};
use sql_import::job::{FileJobStore, JobStore};
use sql_import::source::MssqlSourceFactory;
use sql_import::target::build_target;
use sql_import::{
    Config, ConnectionManager, ImportEngine, ImportError, Job, JobState, LegacyTable,
    SchemaInspector,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "sql-import")]
#[command(about = "Import SQL Server tables into application entities")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sql-import.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test a source connection and report the server version
    TestConnection {
        /// Connection name
        name: String,
    },

    /// List the tables a source connection can see
    FetchTables {
        /// Connection name
        name: String,
    },

    /// Show the columns, primary key and size of a source table
    Columns {
        /// Connection name
        connection: String,

        /// Table name, optionally schema-qualified (schema.table)
        table: String,
    },

    /// List the fields of a target entity
    TargetFields {
        /// Entity name
        entity: String,
    },

    /// Propose field rules for a mapping by matching column names
    GenerateMapping {
        /// Mapping name
        mapping: String,
    },

    /// Check a mapping against the live source and target schemas
    Validate {
        /// Mapping name
        mapping: String,
    },

    /// Transform a few sample rows without writing anything
    TestMapping {
        /// Mapping name
        mapping: String,
    },

    /// Start an import job for a mapping and wait for it
    Run {
        /// Mapping name
        mapping: String,
    },

    /// Resume an errored or cancelled job after its last imported row
    Retry {
        /// Job id
        job_id: String,
    },

    /// List persisted import jobs
    Jobs,

    /// Show one job with its log
    Job {
        /// Job id
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ImportError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::TestConnection { name } => {
            let connections = source_connections(&config)?;
            let check = connections.test_connection(&name).await;
            connections.close_all().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else if check.connected {
                println!("Connection '{}': OK ({}ms)", name, check.latency_ms);
                if let Some(version) = &check.server_version {
                    println!("  Server: {}", version);
                }
            } else {
                println!("Connection '{}': FAILED", name);
                if let Some(error) = &check.error {
                    println!("  Error: {}", error);
                }
            }

            if !check.connected {
                return Err(ImportError::Connectivity(
                    check.error.unwrap_or_else(|| format!("connection '{}' failed", name)),
                ));
            }
        }

        Commands::FetchTables { name } => {
            let connections = source_connections(&config)?;
            connections.ensure_connected(&name).await?;
            let tables = connections.fetch_tables(&name).await;
            connections.close_all().await;
            let tables = tables?;

            if cli.output_json {
                let names: Vec<String> = tables
                    .iter()
                    .map(|(schema, table)| format!("{}.{}", schema, table))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                println!("Found {} tables via '{}':", tables.len(), name);
                for (schema, table) in &tables {
                    println!("  {}.{}", schema, table);
                }
            }
        }

        Commands::Columns { connection, table } => {
            let (schema, table) = match table.split_once('.') {
                Some((schema, table)) => (schema.to_string(), table.to_string()),
                None => ("dbo".to_string(), table),
            };
            let connections = Arc::new(source_connections(&config)?);
            connections.ensure_connected(&connection).await?;
            let inspector = SchemaInspector::new(connections.clone());
            let profile = inspector
                .inspect_table(&connection, &LegacyTable::new(&connection, schema, table))
                .await;
            connections.close_all().await;
            let profile = profile?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                print!("{}", profile.columns_text());
                if let Some(rows) = profile.row_estimate {
                    println!("  ~{} rows", rows);
                }
            }
        }

        Commands::TargetFields { entity } => {
            let target = build_target(&config.target).await?;
            let fields = target.list_fields(&entity).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&fields)?);
            } else {
                println!("Entity '{}' ({} target):", entity, target.kind());
                for field in &fields {
                    let mut flags = Vec::new();
                    if field.required {
                        flags.push("required");
                    }
                    if field.readonly {
                        flags.push("readonly");
                    }
                    if flags.is_empty() {
                        println!("  {} {}", field.name, field.field_type);
                    } else {
                        println!("  {} {} [{}]", field.name, field.field_type, flags.join(", "));
                    }
                }
            }
        }

        Commands::GenerateMapping { mapping } => {
            let engine = ImportEngine::new(config).await?;
            let mut working = engine.mapping(&mapping)?;
            let generated = engine.resolver().generate_default_mapping(&mut working).await;
            engine.close().await;
            let generated = generated?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&generated)?);
            } else {
                print!("{}", serde_yaml::to_string(&generated.rules)?);
                for field in &generated.unmapped_required {
                    eprintln!("Warning: required field '{}' has no matching column", field);
                }
            }
        }

        Commands::Validate { mapping } => {
            let engine = ImportEngine::new(config).await?;
            let mut working = engine.mapping(&mapping)?;
            let result = engine.resolver().ensure_valid(&mut working).await;
            engine.close().await;
            let warnings = result?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&warnings)?);
            } else {
                println!("Mapping '{}' is valid.", mapping);
                for issue in &warnings {
                    println!("  Warning: {}", issue);
                }
            }
        }

        Commands::TestMapping { mapping } => {
            let engine = ImportEngine::new(config).await?;
            let mut working = engine.mapping(&mapping)?;
            let report = engine.resolver().test_mapping(&mut working).await;
            engine.close().await;
            let report = report?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.to_text());
            }
            if let Some(failure) = report.failure {
                return Err(ImportError::row(
                    failure.key.to_string(),
                    ImportError::Write(failure.message),
                ));
            }
        }

        Commands::Run { mapping } => {
            let engine = Arc::new(ImportEngine::new(config).await?);
            let id = engine.start_mapping(&mapping).await?;
            let job = watch_job(&engine, &id).await?;
            engine.close().await;
            report_job(&job, cli.output_json)?;
        }

        Commands::Retry { job_id } => {
            let engine = Arc::new(ImportEngine::new(config).await?);
            engine.executor().load_job(&job_id).await?;
            engine.executor().action_retry(&job_id).await?;
            let job = watch_job(&engine, &job_id).await?;
            engine.close().await;
            report_job(&job, cli.output_json)?;
        }

        Commands::Jobs => {
            let store = FileJobStore::new(&config.settings.state_dir)?;
            let jobs = store.list().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No import jobs.");
            } else {
                for job in &jobs {
                    println!("{}", job.summary_line());
                }
            }
        }

        Commands::Job { job_id } => {
            let store = FileJobStore::new(&config.settings.state_dir)?;
            let job = store.load(&job_id).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                println!("{}", job.summary_line());
                if let Some(error) = &job.error_message {
                    println!("Error: {}", error);
                }
                print!("{}", job.log_text());
            }
        }
    }

    Ok(())
}

/// Connections for commands that only talk to the source.
fn source_connections(config: &Config) -> Result<ConnectionManager, ImportError> {
    ConnectionManager::from_config(config, Arc::new(MssqlSourceFactory))
}

/// Wait for a job, cancelling it when the process is signalled.
async fn watch_job(engine: &Arc<ImportEngine>, id: &str) -> Result<Job, ImportError> {
    let cancel_token = setup_signal_handler();
    let watcher = {
        let engine = engine.clone();
        let id = id.to_string();
        let token = cancel_token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Err(e) = engine.executor().action_cancel(&id) {
                warn!("Could not cancel job {}: {}", id, e);
            }
        })
    };

    let job = engine.executor().wait(id).await;
    watcher.abort();
    job
}

fn report_job(job: &Job, output_json: bool) -> Result<(), ImportError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(job)?);
    } else {
        println!("\nImport job {} {}", job.id, job.state);
        println!("  Mapping: {}", job.mapping);
        if let Some(duration) = job.duration() {
            println!("  Duration: {:.2}s", duration.num_milliseconds() as f64 / 1000.0);
        }
        println!(
            "  Records: {}/{} imported, {} failed",
            job.imported_records, job.total_records, job.failed_records
        );
    }

    match job.state {
        JobState::Done => Ok(()),
        JobState::Cancelled => Err(ImportError::Precondition(format!(
            "job {} was cancelled; resume it with `sql-import retry {}`",
            job.id, job.id
        ))),
        _ => Err(job
            .error_message
            .clone()
            .map(ImportError::Write)
            .unwrap_or_else(|| ImportError::State(format!("job {} ended as {}", job.id, job.state)))),
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Stopping after the current row...", name);
                    token.cancel();
                }
                Err(e) => warn!("Failed to install {} handler: {}", name, e),
            }
        });
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Stopping after the current row...");
                token.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl-C handler: {}", e),
        }
    });

    cancel_token
}
