use clap::Parser;
use dotenv::dotenv;
use smr::SmrError;
use smr::config::LoggingConfig;
use smr::logging::init_tracing;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};
use tracing::{debug, error, warn};

/// Worker side of the protocol: item ids on stdin, results on stdout, `+id`/`!id` on stderr.
#[derive(Parser)]
#[command(name = "smr-map")]
#[command(about = "Runs a map command for every item id read from stdin", long_about = None)]
struct Cli {
    /// Command run once per item; the item id is appended as its last argument
    #[arg(long)]
    command: String,
    /// Attempts per item before reporting it failed
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Log file; stderr is reserved for status lines
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    if let Some(path) = &cli.log_file {
        let logging = LoggingConfig {
            file: Some(path.clone()),
            ..LoggingConfig::default()
        };
        // without a log file there is nowhere safe to log to
        let _ = init_tracing("smr-map", &logging);
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    match serve(&cli, stdin.lock(), stdout.lock(), stderr.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "map worker stopped");
            ExitCode::FAILURE
        }
    }
}

fn serve(
    cli: &Cli,
    input: impl BufRead,
    mut results: impl Write,
    mut status: impl Write,
) -> Result<(), SmrError> {
    debug!("mapper starting to read stdin");
    for line in input.lines() {
        let line = line?;
        let item = line.trim_end_matches('\r');
        if item.is_empty() {
            continue;
        }
        debug!(item, "mapper got item");
        match map_item(&cli.command, item, cli.retries) {
            Some(output) => {
                results.write_all(&output)?;
                results.flush()?;
                writeln!(status, "+{}", item)?;
            }
            None => writeln!(status, "!{}", item)?,
        }
        status.flush()?;
    }
    Ok(())
}

fn map_item(command: &str, item: &str, retries: u32) -> Option<Vec<u8>> {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", command))
            .arg("smr-map")
            .arg(item)
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => return Some(output.stdout),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(item, attempt, code = ?output.status.code(), stderr = %stderr.trim_end(), "map command failed");
            }
            Err(e) => warn!(item, attempt, error = %e, "could not run map command"),
        }
    }
    error!(item, attempts, "could not process item");
    None
}
