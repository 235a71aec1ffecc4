use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use squashmerge::SquashmergeError;

/// Apply a sqdelta patch to a SquashFS archive.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Existing SquashFS archive the patch was generated against.
    source: PathBuf,

    /// sqdelta patch file.
    patch: PathBuf,

    /// Path to write the patched SquashFS archive to.
    target: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match squashmerge::apply(&args.source, &args.patch, &args.target) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        },
    }
}

fn report(err: &SquashmergeError) {
    eprintln!("squashmerge: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
