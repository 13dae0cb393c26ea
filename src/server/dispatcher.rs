//! Accept loop and the three connection-handling disciplines: SELECT (single
//! thread, multiplexed), THREAD (detached thread per connection), and FORK
//! (forked child per connection). Each accepted connection serves exactly one
//! client-initiated operation, though that operation may itself span several
//! frames (READ/WRITE/READDIR).

use std::net::TcpListener;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::warn;
use nix::sys::select::{select, FdSet};
use nix::unistd::ForkResult;
use parking_lot::Mutex;

use crate::server::handlers;
use crate::stats::{ConcurrencyMethod, SharedStats};
use crate::transport::Connection;

/// Live THREAD-mode connection fds, so a FORK child can close them too; a forked
/// child is a copy of the whole process, including every other discipline's open
/// descriptors, not just the SELECT-mode backlog it was handed directly.
type ThreadFds = Arc<Mutex<Vec<RawFd>>>;

/// Run the accept loop forever (or until the listener errors out).
pub fn run(listener: TcpListener, root: PathBuf, stats: Arc<SharedStats>) -> std::io::Result<()> {
    let mut select_conns: Vec<Connection> = Vec::new();
    let thread_fds: ThreadFds = Arc::new(Mutex::new(Vec::new()));

    loop {
        let have_pending_select_conns = !select_conns.is_empty();
        if have_pending_select_conns || stats.conc_method() == ConcurrencyMethod::Select {
            select_round(&listener, &mut select_conns, &root, &stats, &thread_fds)?;
        } else {
            accept_one(&listener, &mut select_conns, &root, &stats, &thread_fds)?;
        }
    }
}

fn select_round(
    listener: &TcpListener,
    select_conns: &mut Vec<Connection>,
    root: &Path,
    stats: &Arc<SharedStats>,
    thread_fds: &ThreadFds,
) -> std::io::Result<()> {
    let mut read_fds = FdSet::new();
    let listener_fd = listener.as_raw_fd();
    read_fds.insert(unsafe { BorrowedFd::borrow_raw(listener_fd) });
    for conn in select_conns.iter() {
        read_fds.insert(unsafe { BorrowedFd::borrow_raw(conn.as_raw_fd()) });
    }

    select(None, &mut read_fds, None, None, None)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    if read_fds.contains(unsafe { BorrowedFd::borrow_raw(listener_fd) }) {
        accept_one(listener, select_conns, root, stats, thread_fds)?;
    }

    let mut i = 0;
    while i < select_conns.len() {
        let fd = select_conns[i].as_raw_fd();
        if read_fds.contains(unsafe { BorrowedFd::borrow_raw(fd) }) {
            let mut conn = select_conns.remove(i);
            serve_one(&mut conn, root, Some(stats));
            stats.dec_select();
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn accept_one(
    listener: &TcpListener,
    select_conns: &mut Vec<Connection>,
    root: &Path,
    stats: &Arc<SharedStats>,
    thread_fds: &ThreadFds,
) -> std::io::Result<()> {
    let (stream, _) = listener.accept()?;
    let conn = Connection::new(stream);

    match stats.conc_method() {
        ConcurrencyMethod::Select | ConcurrencyMethod::Undefined => {
            stats.inc_select();
            select_conns.push(conn);
        }
        ConcurrencyMethod::Thread => {
            stats.inc_thread();
            let fd = conn.as_raw_fd();
            thread_fds.lock().push(fd);
            let root = root.to_path_buf();
            let stats = Arc::clone(stats);
            let thread_fds = Arc::clone(thread_fds);
            thread::spawn(move || {
                let mut conn = conn;
                serve_one(&mut conn, &root, Some(&stats));
                stats.dec_thread();
                thread_fds.lock().retain(|&other| other != fd);
            });
        }
        ConcurrencyMethod::Fork => {
            fork_and_serve(conn, root, stats, listener.as_raw_fd(), select_conns, thread_fds);
        }
    }
    Ok(())
}

fn serve_one(conn: &mut Connection, root: &Path, stats: Option<&SharedStats>) {
    match conn.recv_request(stats) {
        Ok(req) => {
            if let Err(e) = handlers::dispatch(conn, &req, root, stats) {
                warn!("error serving request: {e}");
            }
        }
        Err(e) => warn!("failed to read request: {e}"),
    }
}

/// Fork a child to serve `conn`. The child closes the listening socket and every
/// other pending SELECT-mode and live THREAD-mode connection before touching the
/// filesystem, so a single forked child never holds descriptors it has no business
/// keeping open — it is a full copy of the parent process, not just the one
/// connection it was handed.
fn fork_and_serve(
    conn: Connection,
    root: &Path,
    stats: &Arc<SharedStats>,
    listener_fd: RawFd,
    pending: &[Connection],
    thread_fds: &ThreadFds,
) {
    // Safety: forking while other threads may be live (THREAD-mode workers) is
    // inherently fragile — the child only ever calls async-signal-safe syscalls
    // (close, socket I/O) before exiting, never touching the global allocator in a
    // way that could deadlock on a lock held by a thread that didn't survive the
    // fork.
    let live_thread_fds: Vec<RawFd> = thread_fds.lock().clone();
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            close_fds_for_child(listener_fd, pending, &live_thread_fds);
            stats.inc_fork();
            let mut conn = conn;
            serve_one(&mut conn, root, Some(stats));
            stats.dec_fork();
            std::process::exit(0);
        }
        Ok(ForkResult::Parent { .. }) => {
            drop(conn);
        }
        Err(e) => {
            warn!("fork failed: {e}");
        }
    }
}

/// Close every descriptor a forked child inherited but has no business keeping:
/// the listening socket, every other pending SELECT-mode connection, and every
/// live THREAD-mode connection. A fork duplicates the whole fd table, not just the
/// one connection the child was handed.
fn close_fds_for_child(listener_fd: RawFd, pending: &[Connection], thread_fds: &[RawFd]) {
    let _ = nix::unistd::close(listener_fd);
    for other in pending {
        let _ = nix::unistd::close(other.as_raw_fd());
    }
    for &fd in thread_fds {
        let _ = nix::unistd::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};
    use std::net::{TcpListener as StdTcpListener, TcpStream};
    use std::time::Duration;

    fn is_open(fd: RawFd) -> bool {
        fcntl(unsafe { BorrowedFd::borrow_raw(fd) }, FcntlArg::F_GETFD).is_ok()
    }

    #[test]
    fn close_fds_for_child_closes_listener_pending_and_thread_fds() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let listener_fd = listener.as_raw_fd();

        let pending_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let pending_stream = TcpStream::connect(pending_listener.local_addr().unwrap()).unwrap();
        let pending_fd = pending_stream.as_raw_fd();
        let pending_conn = Connection::new(pending_stream);

        let thread_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let thread_stream = TcpStream::connect(thread_listener.local_addr().unwrap()).unwrap();
        let thread_fd = thread_stream.as_raw_fd();

        assert!(is_open(listener_fd));
        assert!(is_open(pending_fd));
        assert!(is_open(thread_fd));

        close_fds_for_child(listener_fd, std::slice::from_ref(&pending_conn), &[thread_fd]);

        assert!(!is_open(listener_fd));
        assert!(!is_open(pending_fd));
        assert!(!is_open(thread_fd));

        // Both wrappers now hold a closed fd; forget them so their `Drop` doesn't
        // attempt (and fail) to close it again.
        std::mem::forget(listener);
        std::mem::forget(pending_conn);
        std::mem::forget(thread_stream);
    }

    #[test]
    fn accept_one_registers_and_deregisters_thread_mode_fd() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(SharedStats::attach_by_key(std::process::id() + 2_000_000).unwrap());
        stats.set_conc_method(ConcurrencyMethod::Thread);
        let mut select_conns = Vec::new();
        let thread_fds: ThreadFds = Arc::new(Mutex::new(Vec::new()));
        let root = std::env::temp_dir();

        let client = TcpStream::connect(addr).unwrap();
        accept_one(&listener, &mut select_conns, &root, &stats, &thread_fds).unwrap();

        assert_eq!(thread_fds.lock().len(), 1);

        // The spawned thread blocks in `recv_request` until the client sends
        // something; closing the client unblocks it with an EOF error so the thread
        // can deregister itself promptly.
        drop(client);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !thread_fds.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(thread_fds.lock().is_empty(), "thread did not deregister its fd");
    }
}
