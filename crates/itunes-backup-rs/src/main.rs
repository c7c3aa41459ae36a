//! Prints hashcat/John hashes for encrypted iTunes backup manifests.
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Extract $itunes_backup$ hashes from Manifest.plist files
#[derive(Parser)]
#[command(name = "itunes_backup2hashcat", version)]
struct Cli {
    /// Manifest.plist files to process
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Prefix each hash with the file name
    #[arg(short, long)]
    show_filename: bool,

    /// Number of worker threads
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Some(jobs) = cli.jobs {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
        {
            eprintln!("ERROR: could not start worker pool: {e}");
            return ExitCode::FAILURE;
        }
    }

    info!("Processing {} file(s)", cli.files.len());

    let mut failed = false;
    for (path, result) in itunes_backup_rs::util::hash_files(&cli.files) {
        match result {
            Ok(hash) if cli.show_filename => println!("{}:{}", path.display(), hash),
            Ok(hash) => println!("{}", hash),
            // already logged by hash_files
            Err(_) => failed = true,
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
