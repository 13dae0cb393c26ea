//! Cross-process shared statistics record.
//!
//! Created by the first server invocation, keyed by its PID; reattached by later
//! invocations (`-status`, or `-cmethod` with no `-export`) that find a live process
//! at the PID recorded in the rendezvous file, or recreated under the current PID
//! otherwise. All mutations go through the named, `PTHREAD_PROCESS_SHARED` mutex
//! embedded in the record itself; `conc_method` is additionally stored as an
//! [`AtomicU32`] so the dispatcher's accept loop can poll the current concurrency
//! discipline without taking the lock, avoiding a torn read across a live mode switch.
//!
//! There is no ready-made crate in the retrieval pack for named, cross-process shared
//! memory, so this is built directly on `libc`'s POSIX shared-memory and pthread
//! primitives, in the same raw-syscall style the teacher crate uses for its own
//! kernel-resource wrappers.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Rendezvous file carrying the ASCII PID of the currently running server.
pub const RENDEZVOUS_PATH: &str = "/tmp/.samd";

const NAME_FIELD_LEN: usize = 80;
const IP_FIELD_LEN: usize = 32;

/// Server concurrency discipline, as stored in the shared record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConcurrencyMethod {
    Select = 0,
    Thread = 1,
    Fork = 2,
    Undefined = 3,
}

impl ConcurrencyMethod {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => ConcurrencyMethod::Select,
            1 => ConcurrencyMethod::Thread,
            2 => ConcurrencyMethod::Fork,
            _ => ConcurrencyMethod::Undefined,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConcurrencyMethod::Select => "select",
            ConcurrencyMethod::Thread => "pthread",
            ConcurrencyMethod::Fork => "fork",
            ConcurrencyMethod::Undefined => "",
        }
    }
}

impl std::str::FromStr for ConcurrencyMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "select" => Ok(ConcurrencyMethod::Select),
            "pthread" => Ok(ConcurrencyMethod::Thread),
            "fork" => Ok(ConcurrencyMethod::Fork),
            _ => Err(()),
        }
    }
}

/// The in-shared-memory layout. Never constructed directly by callers; accessed only
/// through [`SharedStats`].
#[repr(C)]
struct StatsRecord {
    mutex: libc::pthread_mutex_t,
    server_name: [u8; NAME_FIELD_LEN],
    server_ip: [u8; IP_FIELD_LEN],
    server_dir: [u8; NAME_FIELD_LEN],
    server_pid: i32,
    conc_method: AtomicU32,
    select_count: u32,
    thread_count: u32,
    fork_count: u32,
    bytes_rcvd: u64,
    bytes_sent: u64,
    uplink_rate: u64,
    dnlink_rate: u64,
    uplink_avg: u64,
    dnlink_avg: u64,
}

/// An immutable point-in-time copy of the shared record, safe to hold and render
/// without keeping the mutex.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub server_name: String,
    pub server_ip: String,
    pub server_dir: String,
    pub server_pid: i32,
    pub conc_method: ConcurrencyMethod,
    pub select_count: u32,
    pub thread_count: u32,
    pub fork_count: u32,
    pub bytes_rcvd: u64,
    pub bytes_sent: u64,
    pub uplink_rate: u64,
    pub dnlink_rate: u64,
    pub uplink_avg: u64,
    pub dnlink_avg: u64,
}

/// A handle to the shared statistics record, attached via POSIX shared memory.
pub struct SharedStats {
    ptr: *mut StatsRecord,
}

// Safety: every mutating access to `*ptr` is bracketed by the embedded
// PTHREAD_PROCESS_SHARED mutex, except for the `conc_method` field which is a
// lock-free atomic by design (see module docs).
unsafe impl Send for SharedStats {}
unsafe impl Sync for SharedStats {}

fn fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_fixed_str(field: &mut [u8], s: &OsStr) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field.fill(0);
    field[..n].copy_from_slice(&bytes[..n]);
}

unsafe fn init_record(ptr: *mut StatsRecord) {
    unsafe {
        std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<StatsRecord>());
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        libc::pthread_mutexattr_init(&mut attr);
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutex_init(&raw mut (*ptr).mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        (*ptr).conc_method = AtomicU32::new(ConcurrencyMethod::Undefined as u32);
    }
}

fn shm_open_or_create(name: &CStr) -> io::Result<(libc::c_int, bool)> {
    let created_fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o666,
        )
    };
    if created_fd >= 0 {
        return Ok((created_fd, true));
    }
    let create_err = io::Error::last_os_error();
    if create_err.raw_os_error() != Some(libc::EEXIST) {
        return Err(create_err);
    }
    let existing_fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o666) };
    if existing_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((existing_fd, false))
}

impl SharedStats {
    /// Attach to (or create) the shared record for the server keyed by `rendezvous`.
    pub fn create_or_attach(rendezvous: &Path) -> io::Result<SharedStats> {
        let key_pid = live_pid(rendezvous).unwrap_or_else(std::process::id);
        Self::attach_by_key(key_pid)
    }

    pub(crate) fn attach_by_key(key_pid: u32) -> io::Result<SharedStats> {
        let name = CString::new(format!("/netfs-stats-{key_pid}")).unwrap();
        let (fd, created) = shm_open_or_create(&name)?;
        let size = std::mem::size_of::<StatsRecord>();
        if created {
            let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = map as *mut StatsRecord;
        if created {
            unsafe { init_record(ptr) };
        }
        Ok(SharedStats { ptr })
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut StatsRecordGuard<'_>) -> R) -> R {
        unsafe {
            libc::pthread_mutex_lock(&raw mut (*self.ptr).mutex);
        }
        let mut guard = StatsRecordGuard {
            record: self.ptr,
            _marker: std::marker::PhantomData,
        };
        let result = f(&mut guard);
        unsafe {
            libc::pthread_mutex_unlock(&raw mut (*self.ptr).mutex);
        }
        result
    }

    /// Current concurrency discipline, read without the mutex (see module docs).
    pub fn conc_method(&self) -> ConcurrencyMethod {
        let v = unsafe { (*self.ptr).conc_method.load(Ordering::Acquire) };
        ConcurrencyMethod::from_u32(v)
    }

    pub fn set_conc_method(&self, method: ConcurrencyMethod) {
        self.with_lock(|_| unsafe {
            (*self.ptr).conc_method.store(method as u32, Ordering::Release);
        });
    }

    pub fn set_export_info(&self, name: &OsStr, ip: &OsStr, dir: &OsStr, pid: u32) {
        self.with_lock(|g| unsafe {
            write_fixed_str(&mut (*g.record).server_name, name);
            write_fixed_str(&mut (*g.record).server_ip, ip);
            write_fixed_str(&mut (*g.record).server_dir, dir);
            (*g.record).server_pid = pid as i32;
        });
    }

    pub fn reset_counters(&self) {
        self.with_lock(|g| unsafe {
            (*g.record).select_count = 0;
            (*g.record).thread_count = 0;
            (*g.record).fork_count = 0;
            (*g.record).bytes_rcvd = 0;
            (*g.record).bytes_sent = 0;
            (*g.record).uplink_rate = 0;
            (*g.record).dnlink_rate = 0;
            (*g.record).uplink_avg = 0;
            (*g.record).dnlink_avg = 0;
        });
    }

    pub fn record_received(&self, n: u64) {
        self.with_lock(|g| unsafe {
            (*g.record).bytes_rcvd += n;
            (*g.record).dnlink_rate += n;
        });
    }

    pub fn record_sent(&self, n: u64) {
        self.with_lock(|g| unsafe {
            (*g.record).bytes_sent += n;
            (*g.record).uplink_rate += n;
        });
    }

    pub fn inc_select(&self) {
        self.with_lock(|g| unsafe { (*g.record).select_count += 1 });
    }
    pub fn dec_select(&self) {
        self.with_lock(|g| unsafe { (*g.record).select_count = (*g.record).select_count.saturating_sub(1) });
    }
    pub fn inc_thread(&self) {
        self.with_lock(|g| unsafe { (*g.record).thread_count += 1 });
    }
    pub fn dec_thread(&self) {
        self.with_lock(|g| unsafe { (*g.record).thread_count = (*g.record).thread_count.saturating_sub(1) });
    }
    pub fn inc_fork(&self) {
        self.with_lock(|g| unsafe { (*g.record).fork_count += 1 });
    }
    pub fn dec_fork(&self) {
        self.with_lock(|g| unsafe { (*g.record).fork_count = (*g.record).fork_count.saturating_sub(1) });
    }

    /// Update the exponential averages from the current rates, then zero the rates.
    /// Called once per second by the `-status` dashboard loop.
    pub fn tick_rates(&self) {
        self.with_lock(|g| unsafe {
            let r = g.record;
            (*r).uplink_avg = if (*r).uplink_avg == 0 {
                (*r).uplink_rate
            } else {
                (2 * (*r).uplink_avg + (*r).uplink_rate) / 3
            };
            (*r).dnlink_avg = if (*r).dnlink_avg == 0 {
                (*r).dnlink_rate
            } else {
                (2 * (*r).dnlink_avg + (*r).dnlink_rate) / 3
            };
            (*r).uplink_rate = 0;
            (*r).dnlink_rate = 0;
        });
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // Reading outside the mutex is permitted here: counters observed concurrently
        // may be momentarily inconsistent, which is acceptable for a dashboard.
        let r = unsafe { &*self.ptr };
        StatsSnapshot {
            server_name: fixed_str(&r.server_name),
            server_ip: fixed_str(&r.server_ip),
            server_dir: fixed_str(&r.server_dir),
            server_pid: r.server_pid,
            conc_method: self.conc_method(),
            select_count: r.select_count,
            thread_count: r.thread_count,
            fork_count: r.fork_count,
            bytes_rcvd: r.bytes_rcvd,
            bytes_sent: r.bytes_sent,
            uplink_rate: r.uplink_rate,
            dnlink_rate: r.dnlink_rate,
            uplink_avg: r.uplink_avg,
            dnlink_avg: r.dnlink_avg,
        }
    }
}

struct StatsRecordGuard<'a> {
    record: *mut StatsRecord,
    #[allow(dead_code)]
    _marker: std::marker::PhantomData<&'a mut StatsRecord>,
}

impl Drop for SharedStats {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, std::mem::size_of::<StatsRecord>());
        }
    }
}

/// Read the PID recorded in the rendezvous file, if it names a still-live process.
/// A rendezvous file naming a dead process is stale and ignored.
pub fn live_pid(rendezvous: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(rendezvous).ok()?;
    let pid: i32 = text.trim().parse().ok()?;
    kill(Pid::from_raw(pid), None).ok()?;
    Some(pid as u32)
}

/// Overwrite the rendezvous file with the current process's PID.
pub fn write_rendezvous_pid(rendezvous: &Path, pid: u32) -> io::Result<()> {
    std::fs::write(rendezvous, pid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrency_method_round_trips_through_cli_spelling() {
        assert_eq!("select".parse(), Ok(ConcurrencyMethod::Select));
        assert_eq!("pthread".parse(), Ok(ConcurrencyMethod::Thread));
        assert_eq!("fork".parse(), Ok(ConcurrencyMethod::Fork));
        assert_eq!("bogus".parse::<ConcurrencyMethod>(), Err(()));
    }

    #[test]
    fn shared_stats_create_and_mutate() {
        let stats = SharedStats::attach_by_key(std::process::id() + 1_000_000).unwrap();
        stats.set_conc_method(ConcurrencyMethod::Fork);
        assert_eq!(stats.conc_method(), ConcurrencyMethod::Fork);

        stats.inc_fork();
        stats.inc_fork();
        stats.dec_fork();
        assert_eq!(stats.snapshot().fork_count, 1);

        stats.record_received(100);
        stats.record_sent(40);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_rcvd, 100);
        assert_eq!(snap.bytes_sent, 40);

        stats.tick_rates();
        let snap = stats.snapshot();
        assert_eq!(snap.uplink_avg, 40);
        assert_eq!(snap.dnlink_avg, 100);
        assert_eq!(snap.uplink_rate, 0);
        assert_eq!(snap.dnlink_rate, 0);
    }

    #[test]
    fn counters_stay_consistent_under_concurrent_inc_dec() {
        let stats = Arc::new(SharedStats::attach_by_key(std::process::id() + 1_000_001).unwrap());
        stats.reset_counters();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        stats.inc_thread();
                        stats.dec_thread();
                        stats.inc_fork();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        // Every inc_thread is paired with a dec_thread, so the net count returns to
        // zero regardless of interleaving; fork_count only ever increments, so it
        // must land exactly on the total of every thread's contribution.
        assert_eq!(snap.thread_count, 0);
        assert_eq!(snap.fork_count, 8 * 500);
    }
}
