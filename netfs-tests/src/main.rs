//! Integration test runner for `netfs`: builds the real `netfsd` and
//! `netfs-mount` binaries, exports a temp directory, mounts it, and exercises
//! the filesystem through the mount point for each concurrency method.

mod canonical_temp_dir;
mod command_utils;
mod mount_util;
mod roundtrip;

use clap::{Parser, ValueEnum};

use roundtrip::run_roundtrip_test;

#[derive(Parser)]
#[command(name = "netfs-tests", about = "Run netfs end-to-end tests")]
struct Cli {
    /// Limit the run to a single concurrency method; defaults to all three.
    #[arg(long, value_enum)]
    cmethod: Option<Cmethod>,
}

#[derive(Copy, Clone, ValueEnum)]
enum Cmethod {
    Select,
    Pthread,
    Fork,
}

impl Cmethod {
    fn as_str(self) -> &'static str {
        match self {
            Cmethod::Select => "select",
            Cmethod::Pthread => "pthread",
            Cmethod::Fork => "fork",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let methods = match cli.cmethod {
        Some(m) => vec![m],
        None => vec![Cmethod::Select, Cmethod::Pthread, Cmethod::Fork],
    };

    for method in methods {
        eprintln!("=== Running roundtrip test with cmethod={} ===", method.as_str());
        run_roundtrip_test(method.as_str()).await?;
    }

    eprintln!("All tests passed.");
    Ok(())
}
