//! Server-side pieces: the `netfsd` binary's three subcommands (`export`, `status`,
//! `-cmethod` against a live server) are built from these.

pub mod dispatcher;
pub mod handlers;

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;

use crate::error::NetfsError;
use crate::proto::SERVER_PORT;
use crate::stats::{ConcurrencyMethod, SharedStats, RENDEZVOUS_PATH};

/// Start exporting `dir` on `ip`, blocking forever (or until the listener errors).
///
/// `cmethod` mirrors the standalone `-cmethod` flag: when given it is applied
/// unconditionally, independent of whatever was left over in shared memory from a
/// prior export. Only when nothing was ever set (a fresh record, still
/// [`ConcurrencyMethod::Undefined`]) and no `cmethod` was given does this default to
/// [`ConcurrencyMethod::Thread`].
pub fn export(
    ip: Ipv4Addr,
    dir: PathBuf,
    cmethod: Option<ConcurrencyMethod>,
    binary_name: &str,
) -> Result<(), NetfsError> {
    if !dir.is_dir() {
        return Err(NetfsError::InvalidExportDir(dir));
    }

    let rendezvous = Path::new(RENDEZVOUS_PATH);
    let stats = Arc::new(SharedStats::create_or_attach(rendezvous).map_err(NetfsError::Stats)?);

    let pid = std::process::id();
    crate::stats::write_rendezvous_pid(rendezvous, pid).map_err(NetfsError::Stats)?;

    stats.set_export_info(
        std::ffi::OsStr::new(binary_name),
        std::ffi::OsStr::new(&ip.to_string()),
        dir.as_os_str(),
        pid,
    );

    let addr = SocketAddr::from((ip, SERVER_PORT));
    let listener = TcpListener::bind(addr).map_err(NetfsError::Bind)?;

    if let Some(cmethod) = cmethod {
        stats.set_conc_method(cmethod);
    }
    // A concurrency method left over from a previous, differently-configured
    // export (or never set at all) is not a valid runtime choice; default it.
    if stats.conc_method() == ConcurrencyMethod::Undefined {
        stats.set_conc_method(ConcurrencyMethod::Thread);
    }
    stats.reset_counters();

    info!(
        "server started with pid {pid}, listening on {ip} and exporting {}",
        dir.display()
    );

    dispatcher::run(listener, dir, stats).map_err(NetfsError::Bind)
}

/// Update the concurrency method of an already-running server, found via the
/// rendezvous file. Returns `false` if no live server was found.
pub fn set_live_cmethod(method: ConcurrencyMethod) -> Result<bool, NetfsError> {
    let rendezvous = Path::new(RENDEZVOUS_PATH);
    if crate::stats::live_pid(rendezvous).is_none() {
        return Ok(false);
    }
    let stats = SharedStats::create_or_attach(rendezvous).map_err(NetfsError::Stats)?;
    stats.set_conc_method(method);
    Ok(true)
}

/// Render the live dashboard to stdout once per second, forever.
pub fn run_status_dashboard() -> Result<(), NetfsError> {
    let rendezvous = Path::new(RENDEZVOUS_PATH);
    let stats = SharedStats::create_or_attach(rendezvous).map_err(NetfsError::Stats)?;

    loop {
        stats.tick_rates();
        let snap = stats.snapshot();
        print!("\x1b[H\x1b[2J");
        println!();
        println!("   +--------------------------------------------------------------------------+");
        println!("   |                             Server Dashboard                             |");
        println!("   +--------------------------------------------------------------------------+");
        println!(
            "   | Server Binary : {:<27} Server PID : {:>15} |",
            snap.server_name, snap.server_pid
        );
        println!(
            "   | Source Dir    : {:<27} Server IP  : {:>15} |",
            snap.server_dir, snap.server_ip
        );
        println!("   +--------------------------------------------------------------------------+");
        println!(
            "   | Concurrency Method Being Used : {:<43}|",
            snap.conc_method.as_str()
        );
        println!(
            "   | Select Clients : {:<10} Thread Clients : {:<10} Forked Clients : {:<10} |",
            snap.select_count, snap.thread_count, snap.fork_count
        );
        println!(
            "   | Total Bytes Received : {:<11} Total Bytes Sent : {:<11} |",
            snap.bytes_rcvd, snap.bytes_sent
        );
        println!(
            "   | Downlink Data Rate   : {:<11} Uplink Data Rate : {:<11} |",
            crate::rate::format_rate(snap.dnlink_rate),
            crate::rate::format_rate(snap.uplink_rate)
        );
        println!(
            "   | Avg. Downlink Rate   : {:<11} Avg. Uplink Rate : {:<11} |",
            crate::rate::format_rate(snap.dnlink_avg),
            crate::rate::format_rate(snap.uplink_avg)
        );
        println!("   +--------------------------------------------------------------------------+");
        println!();

        thread::sleep(Duration::from_secs(1));
    }
}
