//! The `netfs-mount` binary: projects a remote directory tree exported by `netfsd`
//! through FUSE at a local mount point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fuser::MountOption;

use netfs::client::RemoteFilesystem;
use netfs::error::NetfsError;
use netfs::mount_arg::parse_source;
use netfs::proto::SERVER_PORT;

#[derive(Parser)]
#[command(name = "netfs-mount", about = "Mount a remote directory tree over TCP")]
struct Cli {
    /// Server address, optionally followed by `:path` (e.g. `10.0.0.2:/exports/data`).
    source: String,
    /// Local directory to mount at.
    mount_point: PathBuf,
    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
    /// Unmount automatically when this process exits.
    #[arg(long)]
    auto_unmount: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("netfs-mount: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> Result<(), NetfsError> {
    let source = parse_source(&cli.source)?;
    let addr = SocketAddr::from((source.ip, SERVER_PORT));

    let mut options = vec![MountOption::FSName("netfs".to_string())];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }
    if cli.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let fs = RemoteFilesystem::new(addr, source.url);
    fuser::mount2(fs, cli.mount_point, &options).map_err(NetfsError::Mount)
}
