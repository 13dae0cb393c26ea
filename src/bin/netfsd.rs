//! The `netfsd` binary: exports a directory over TCP, prints the live status
//! dashboard, or updates the concurrency method of an already-running server.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use netfs::error::NetfsError;
use netfs::stats::ConcurrencyMethod;

#[derive(Parser)]
#[command(name = "netfsd", about = "Export a directory tree over TCP for netfs-mount")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export `dir` on `ip`, blocking forever.
    Export {
        ip: Ipv4Addr,
        dir: PathBuf,
        #[arg(long, value_enum)]
        cmethod: Option<CmethodArg>,
    },
    /// Print the live status dashboard, refreshed once per second.
    Status,
    /// Change the concurrency method of an already-running server.
    Cmethod { method: CmethodArg },
}

#[derive(Copy, Clone, ValueEnum)]
enum CmethodArg {
    Select,
    Pthread,
    Fork,
}

impl From<CmethodArg> for ConcurrencyMethod {
    fn from(arg: CmethodArg) -> Self {
        match arg {
            CmethodArg::Select => ConcurrencyMethod::Select,
            CmethodArg::Pthread => ConcurrencyMethod::Thread,
            CmethodArg::Fork => ConcurrencyMethod::Fork,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Export { ip, dir, cmethod } => {
            netfs::server::export(ip, dir, cmethod.map(Into::into), "netfsd")
        }
        Command::Status => netfs::server::run_status_dashboard(),
        Command::Cmethod { method } => match netfs::server::set_live_cmethod(method.into()) {
            Ok(true) => {
                println!("Concurrency method updated.");
                Ok(())
            }
            Ok(false) => {
                println!("No running server found.");
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        report(e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn report(e: NetfsError) {
    eprintln!("netfsd: {e}");
}
