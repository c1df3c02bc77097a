use std::io::{self, Read};
use std::path::PathBuf;

use clap::Parser;
use pyjail::{run_isolated_with, SandboxSettings};
use tracing_subscriber::EnvFilter;

/// Run Python source in a capability-restricted sandbox and emit a JSON report.
#[derive(Parser, Debug)]
#[command(
    name = "pyjail-cli",
    about = "Run Python source in a capability-restricted sandbox and emit a JSON report"
)]
struct Args {
    /// Read Python source from file instead of stdin
    #[arg(long)]
    file: Option<PathBuf>,

    /// JSON settings file; missing fields take their defaults
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Comma-separated builtins to revoke before running
    #[arg(long, value_delimiter = ',')]
    revoke: Vec<String>,

    /// Comma-separated builtins to grant before running
    #[arg(long, value_delimiter = ',')]
    grant: Vec<String>,

    /// Comma-separated list of importable modules (replaces the configured set)
    #[arg(long)]
    modules: Option<String>,

    /// Timeout in nanoseconds (overrides the configured value)
    #[arg(long)]
    timeout: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pyjail=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let source = match &args.file {
        Some(path) => std::fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!("Error reading {}: {e}", path.display());
            std::process::exit(1);
        }),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
                eprintln!("Error reading stdin: {e}");
                std::process::exit(1);
            });
            buf
        }
    };

    let mut settings = match &args.settings {
        Some(path) => SandboxSettings::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }),
        None => SandboxSettings::from_env(),
    };
    if let Some(modules) = &args.modules {
        settings.allowed_modules = modules.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(timeout) = args.timeout {
        settings.timeout_ns = timeout;
    }

    let grant = args.grant;
    let revoke = args.revoke;
    let report = run_isolated_with(&source, settings, move |caps| {
        for name in grant.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            caps.grant(name)?;
        }
        for name in revoke.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            caps.remove(name);
        }
        Ok(())
    })
    .unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // Guest failures are part of the report; the exit code stays 0.
    match serde_json::to_string(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error serializing report: {e}");
            std::process::exit(1);
        }
    }
}
