//! crossdiff operator CLI.
//!
//! `serve` runs the HTTP control plane; `compare`, `compare-schema`, and
//! `test-connection` drive the same engine one-shot from the command
//! line.
//!
//! Exit codes: 0 ok; 1 usage; 2 connection failure; 3 comparison
//! completed with differences; 4 internal error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crossdiff::api::{self, AppState};
use crossdiff::config::Settings;
use crossdiff::descriptor::ConnDescriptor;
use crossdiff::driver;
use crossdiff::error::{DiffError, ErrorKind};
use crossdiff::job::{Algorithm, CompareRequest, ComparisonConfig, SchemaCompareRequest};
use crossdiff::scheduler::Scheduler;
use crossdiff::store::ResultStore;

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_CONNECTION: u8 = 2;
const EXIT_DIFFERENCES: u8 = 3;
const EXIT_INTERNAL: u8 = 4;

#[derive(Parser)]
#[command(
    name = "crossdiff",
    version,
    about = "Cross-database table and schema comparison"
)]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(long, global = true, env = "CROSSDIFF_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "CROSSDIFF_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control plane and job workers.
    Serve {
        /// Listen address, e.g. 0.0.0.0:8742.
        #[arg(long, env = "CROSSDIFF_LISTEN")]
        listen: Option<String>,
        /// Result store URL (sqlite://… or postgres://…).
        #[arg(long, env = "CROSSDIFF_STORE_URL")]
        store_url: Option<String>,
    },
    /// Compare two tables and print the summary.
    Compare {
        /// Source connection URL.
        #[arg(long)]
        source_url: String,
        /// Target connection URL.
        #[arg(long)]
        target_url: String,
        /// Source table (optionally namespace-qualified).
        #[arg(long)]
        table: String,
        /// Target table; defaults to the source table name.
        #[arg(long)]
        target_table: Option<String>,
        /// Key columns, comma-separated.
        #[arg(long, value_delimiter = ',')]
        key_columns: Vec<String>,
        /// Columns to compare; defaults to every common column.
        #[arg(long, value_delimiter = ',')]
        compare_columns: Option<Vec<String>>,
        /// Columns to exclude.
        #[arg(long, value_delimiter = ',')]
        exclude_columns: Option<Vec<String>>,
        /// Extra WHERE condition applied to both sides.
        #[arg(long)]
        where_condition: Option<String>,
        /// Diff algorithm.
        #[arg(long, default_value = "hash")]
        algorithm: String,
        /// Worker budget for the bisection.
        #[arg(long)]
        threads: Option<usize>,
        /// Numeric tolerance for float comparisons.
        #[arg(long)]
        tolerance: Option<f64>,
        /// Print every diff row as JSON lines.
        #[arg(long)]
        print_rows: bool,
    },
    /// Compare two schemas and print the structural diff.
    CompareSchema {
        #[arg(long)]
        source_url: String,
        #[arg(long)]
        target_url: String,
        /// Namespace filter applied to both sides.
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Probe a connection descriptor.
    TestConnection {
        /// Connection URL.
        url: String,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap renders its own message; keep the documented usage code.
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    init_tracing(cli.log_json);

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime start failed: {e}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    let code = runtime.block_on(run(cli.command, settings));
    runtime.block_on(driver::close_all());
    ExitCode::from(code)
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: Command, mut settings: Settings) -> u8 {
    match command {
        Command::Serve { listen, store_url } => {
            if let Some(listen) = listen {
                settings.listen = listen;
            }
            if let Some(url) = store_url {
                settings.store_url = url;
            }
            match serve(settings).await {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    eprintln!("serve failed: {e}");
                    exit_code_for(&e)
                }
            }
        }
        Command::Compare {
            source_url,
            target_url,
            table,
            target_table,
            key_columns,
            compare_columns,
            exclude_columns,
            where_condition,
            algorithm,
            threads,
            tolerance,
            print_rows,
        } => {
            let algorithm = match algorithm.as_str() {
                "hash" => Algorithm::Hash,
                "join" => Algorithm::Join,
                other => {
                    eprintln!("unknown algorithm {other:?} (expected hash or join)");
                    return EXIT_USAGE;
                }
            };
            let request = match build_request(
                &source_url,
                &target_url,
                table,
                target_table,
                key_columns,
                compare_columns,
                exclude_columns,
                where_condition,
                algorithm,
                threads,
                tolerance,
            ) {
                Ok(r) => r,
                Err(e) => {
                    eprintln!("{e}");
                    return EXIT_USAGE;
                }
            };
            match compare_once(settings, request, print_rows).await {
                Ok(differences) => {
                    if differences > 0 {
                        EXIT_DIFFERENCES
                    } else {
                        EXIT_OK
                    }
                }
                Err(e) => {
                    eprintln!("comparison failed: {e}");
                    exit_code_for(&e)
                }
            }
        }
        Command::CompareSchema {
            source_url,
            target_url,
            namespace,
        } => match schema_once(settings, &source_url, &target_url, namespace).await {
            Ok(has_differences) => {
                if has_differences {
                    EXIT_DIFFERENCES
                } else {
                    EXIT_OK
                }
            }
            Err(e) => {
                eprintln!("schema comparison failed: {e}");
                exit_code_for(&e)
            }
        },
        Command::TestConnection { url } => {
            let descriptor = match ConnDescriptor::from_url(&url) {
                Ok(d) => d,
                Err(e) => {
                    eprintln!("{e}");
                    return EXIT_USAGE;
                }
            };
            match test_connection(settings, descriptor).await {
                Ok(()) => {
                    println!("ok");
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("connection failed: {e}");
                    exit_code_for(&e)
                }
            }
        }
    }
}

fn exit_code_for(e: &DiffError) -> u8 {
    match e.kind() {
        ErrorKind::InvalidConfig => EXIT_USAGE,
        ErrorKind::Unreachable
        | ErrorKind::AuthFailure
        | ErrorKind::PermissionDenied
        | ErrorKind::PoolExhausted => EXIT_CONNECTION,
        _ => EXIT_INTERNAL,
    }
}

async fn serve(settings: Settings) -> Result<(), DiffError> {
    settings.validate()?;
    let store = ResultStore::connect(&settings.store_url).await?;
    let listen = settings.listen.clone();
    let scheduler = Scheduler::start(settings, store).await?;
    api::serve(AppState { scheduler }, &listen).await
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    source_url: &str,
    target_url: &str,
    table: String,
    target_table: Option<String>,
    key_columns: Vec<String>,
    compare_columns: Option<Vec<String>>,
    exclude_columns: Option<Vec<String>>,
    where_condition: Option<String>,
    algorithm: Algorithm,
    threads: Option<usize>,
    tolerance: Option<f64>,
) -> Result<CompareRequest, DiffError> {
    if key_columns.is_empty() {
        return Err(DiffError::InvalidConfig(
            "--key-columns requires at least one column".into(),
        ));
    }
    Ok(CompareRequest {
        source_config: ConnDescriptor::from_url(source_url)?,
        target_config: ConnDescriptor::from_url(target_url)?,
        comparison_config: ComparisonConfig {
            source_table: table,
            target_table,
            key_columns,
            compare_columns,
            exclude_columns,
            where_condition,
            algorithm,
            sample_size: None,
            threads,
            tolerance,
            case_insensitive: None,
            materialize_results: None,
            enable_column_statistics: None,
            timeline_column: None,
            bisection_threshold: None,
            bisection_factor: None,
        },
    })
}

/// One-shot comparison sharing the engine with the server path, printing
/// the summary (and optionally each diff row) to stdout.
async fn compare_once(
    settings: Settings,
    request: CompareRequest,
    print_rows: bool,
) -> Result<u64, DiffError> {
    let store = ResultStore::connect("sqlite://:memory:").await?;
    let scheduler = Scheduler::start(settings, store).await?;
    let id = scheduler.submit_table(request).await?;

    let job = loop {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let Some(job) = scheduler.get(id).await? else {
            return Err(DiffError::Internal("submitted job vanished".into()));
        };
        if job.state.is_terminal() {
            break job;
        }
    };

    if let (Some(kind), Some(message)) = (&job.error_kind, &job.error) {
        let kind = ErrorKind::parse(kind).unwrap_or(ErrorKind::Internal);
        return Err(match kind {
            ErrorKind::InvalidConfig => DiffError::InvalidConfig(message.clone()),
            ErrorKind::Unreachable => DiffError::Unreachable(message.clone()),
            ErrorKind::AuthFailure => DiffError::AuthFailure(message.clone()),
            ErrorKind::NoSuchObject => DiffError::NoSuchObject(message.clone()),
            _ => DiffError::QueryFailure(message.clone()),
        });
    }

    let summary = job
        .summary
        .ok_or_else(|| DiffError::Internal("completed job without summary".into()))?;
    if print_rows {
        let mut page = 0;
        loop {
            let rows = scheduler.store().diff_rows(id, page * 1_000, 1_000).await?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                println!(
                    "{}",
                    serde_json::to_string(row).unwrap_or_else(|_| "{}".into())
                );
            }
            page += 1;
        }
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );
    Ok(summary.rows_different)
}

async fn schema_once(
    settings: Settings,
    source_url: &str,
    target_url: &str,
    namespace: Option<String>,
) -> Result<bool, DiffError> {
    let store = ResultStore::connect("sqlite://:memory:").await?;
    let scheduler = Scheduler::start(settings, store).await?;
    let namespaces = namespace.map(|n| vec![n]);
    let diff = scheduler
        .run_schema(SchemaCompareRequest {
            source_config: ConnDescriptor::from_url(source_url)?,
            target_config: ConnDescriptor::from_url(target_url)?,
            source_namespaces: namespaces.clone(),
            target_namespaces: namespaces,
        })
        .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&diff).unwrap_or_default()
    );
    let has_differences = !diff.tables_only_in_source.is_empty()
        || !diff.tables_only_in_target.is_empty()
        || !diff.per_table.is_empty();
    Ok(has_differences)
}

async fn test_connection(
    settings: Settings,
    descriptor: ConnDescriptor,
) -> Result<(), DiffError> {
    let driver = driver::open(&descriptor, &settings).await?;
    driver.ping().await
}
