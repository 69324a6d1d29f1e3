mod config;
mod ingest;
mod replay;
mod trust;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Exit code when at least one record was rejected or out of order.
const EXIT_REFUSED: i32 = 2;

/// Tamper-evident decision log ingestion and replay.
#[derive(Parser)]
#[command(
    name = "declog",
    version,
    about = "Tamper-evident decision log ingestion and replay"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest NDJSON decision records into a journal
    Ingest {
        /// NDJSON input file, or '-' for stdin
        input: String,
        /// Journal file (created if absent)
        #[arg(long)]
        store: PathBuf,
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Mark this run as a backfill (out-of-order records may be accepted
        /// when the config allows it)
        #[arg(long)]
        backfill: bool,
    },

    /// Print stored records as NDJSON
    Replay {
        /// Journal file
        #[arg(long)]
        store: PathBuf,
        /// Only this actor
        #[arg(long)]
        actor: Option<String>,
        /// Only this run
        #[arg(long)]
        run: Option<String>,
        /// Resume after this position
        #[arg(long)]
        after: Option<u64>,
        /// Merge streams by replay key instead of commit order
        #[arg(long)]
        merged: bool,
    },

    /// Show per-stream cursors and per-actor trust tiers
    Status {
        /// Journal file
        #[arg(long)]
        store: PathBuf,
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Fill in integrity.entry_hash (and signature) for NDJSON records
    Seal {
        /// NDJSON input file, or '-' for stdin
        input: String,
        /// Secret key file from `declog keygen`; signs each record
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Print the entry hash of one JSON record
    Hash {
        /// JSON record file
        file: PathBuf,
    },

    /// Generate an Ed25519 signing keypair
    Keygen {
        /// Output file prefix
        #[arg(long, default_value = "declog")]
        prefix: String,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            input,
            store,
            config,
            backfill,
        } => {
            let config = load_config_or_exit(config.as_deref(), cli.output, cli.quiet);
            let text = read_input_or_exit(&input, cli.output, cli.quiet);
            let summary = block_on_or_exit(
                ingest::cmd_ingest(&text, &store, &config, backfill, cli.output, cli.quiet),
                cli.output,
                cli.quiet,
            );
            if summary.refused() {
                process::exit(EXIT_REFUSED);
            }
        }
        Commands::Replay {
            store,
            actor,
            run,
            after,
            merged,
        } => {
            init_logging(None);
            block_on_or_exit(
                replay::cmd_replay(&store, actor, run, after, merged),
                cli.output,
                cli.quiet,
            );
        }
        Commands::Status { store, config } => {
            let config = load_config_or_exit(config.as_deref(), cli.output, cli.quiet);
            block_on_or_exit(
                replay::cmd_status(&store, &config, cli.output),
                cli.output,
                cli.quiet,
            );
        }
        Commands::Seal { input, key } => {
            init_logging(None);
            cmd_seal(&input, key.as_deref(), cli.output, cli.quiet);
        }
        Commands::Hash { file } => {
            init_logging(None);
            cmd_hash(&file, cli.output, cli.quiet);
        }
        Commands::Keygen { prefix } => {
            init_logging(None);
            match trust::keygen::write_keypair(&prefix) {
                Ok(files) => {
                    if !cli.quiet {
                        println!(
                            "Generated Ed25519 keypair: {}, {} (fingerprint {})",
                            files.secret, files.public, files.fingerprint
                        );
                    }
                }
                Err(e) => {
                    report_error(&e, cli.output, cli.quiet);
                    process::exit(1);
                }
            }
        }
    }
}

/// `RUST_LOG`, else the config's `[logging] filter`, else `info`. Logs go
/// to stderr so stdout stays machine-readable.
fn init_logging(configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| configured.and_then(|f| EnvFilter::try_new(f).ok()))
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_config_or_exit(
    path: Option<&Path>,
    output: OutputFormat,
    quiet: bool,
) -> config::CliConfig {
    match config::load(path) {
        Ok(config) => {
            init_logging(config.logging.filter.as_deref());
            config
        }
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    }
}

fn read_input_or_exit(input: &str, output: OutputFormat, quiet: bool) -> String {
    let result = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map(|_| buf)
            .map_err(|e| format!("error reading stdin: {}", e))
    } else {
        std::fs::read_to_string(input).map_err(|e| format!("error reading file '{}': {}", input, e))
    };
    result.unwrap_or_else(|e| {
        report_error(&e, output, quiet);
        process::exit(1);
    })
}

fn block_on_or_exit<T>(
    fut: impl std::future::Future<Output = Result<T, String>>,
    output: OutputFormat,
    quiet: bool,
) -> T {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("failed to create tokio runtime: {}", e), output, quiet);
            process::exit(1);
        }
    };
    match rt.block_on(fut) {
        Ok(v) => v,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    }
}

fn cmd_seal(input: &str, key_path: Option<&Path>, output: OutputFormat, quiet: bool) {
    let key = match key_path.map(trust::keygen::read_secret_key).transpose() {
        Ok(k) => k,
        Err(e) => {
            report_error(&e, output, quiet);
            process::exit(1);
        }
    };
    let text = read_input_or_exit(input, output, quiet);

    let mut failed = 0usize;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match trust::seal::seal_line(line, key.as_ref()) {
            Ok(sealed) => println!("{}", sealed),
            Err(e) => {
                failed += 1;
                report_error(&format!("line {}: {}", idx + 1, e), output, quiet);
            }
        }
    }
    if failed > 0 {
        process::exit(EXIT_REFUSED);
    }
}

fn cmd_hash(file: &Path, output: OutputFormat, quiet: bool) {
    let raw = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            report_error(&format!("error reading file '{}': {}", file.display(), e), output, quiet);
            process::exit(1);
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            report_error(
                &format!("error parsing JSON in '{}': {}", file.display(), e),
                output,
                quiet,
            );
            process::exit(1);
        }
    };
    match trust::seal::hash_value(&value) {
        Ok(hash) => match output {
            OutputFormat::Text => println!("{}", hash),
            OutputFormat::Json => println!("{}", serde_json::json!({"entry_hash": hash})),
        },
        Err(e) => {
            report_error(&format!("invalid record: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({"error": msg}));
        }
    }
}
