//! One function per wire operation: resolve the local path, perform the syscall,
//! and write the response frame(s).
//!
//! `Access`, `Opendir`, `Releasedir`, `Open`, and `Release` have no handler here:
//! the reference client answers those locally without a round trip (permission
//! checks and file-descriptor bookkeeping the kernel already did), so the server
//! never receives them. [`dispatch`] answers any that do arrive with `ENOSYS`.

use std::ffi::OsStr;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::debug;
use zerocopy::IntoBytes;

use crate::path_resolve::resolve_checked;
use crate::proto::{
    DirEntryWire, FileAttrWire, FileKind, OpCode, Request, Response, StatfsWire, TimesWire,
    DATA_SIZE,
};
use crate::stats::SharedStats;
use crate::transport::Connection;

fn resolve_or_errno(root: &Path, req: &Request) -> Result<PathBuf, i32> {
    let url = req.url().map_err(|_| libc::EINVAL)?;
    let uri = req.uri().map_err(|_| libc::EINVAL)?;
    resolve_checked(root, url, uri).map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
}

fn io_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn kind_from_file_type(ft: std::fs::FileType) -> FileKind {
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else if ft.is_file() {
        FileKind::RegularFile
    } else {
        FileKind::Other
    }
}

fn kind_from_mode(mode: u32) -> FileKind {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileKind::Directory,
        m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
        m if m == libc::S_IFREG as u32 => FileKind::RegularFile,
        _ => FileKind::Other,
    }
}

fn attr_from_stat(st: &libc::stat) -> FileAttrWire {
    FileAttrWire::new(
        st.st_size as u64,
        st.st_blocks as u64,
        st.st_atime,
        st.st_mtime,
        st.st_ctime,
        st.st_mode as u32,
        st.st_nlink as u32,
        st.st_uid,
        st.st_gid,
        kind_from_mode(st.st_mode as u32).into(),
    )
}

/// Dispatch one request to its handler, writing whatever response frame(s) result.
pub fn dispatch(
    conn: &mut Connection,
    req: &Request,
    root: &Path,
    stats: Option<&SharedStats>,
) -> io::Result<()> {
    match req.opcode() {
        Ok(OpCode::Getattr) => handle_getattr(conn, req, root, stats),
        Ok(OpCode::Mkdir) => handle_mkdir(conn, req, root, stats),
        Ok(OpCode::Readdir) => handle_readdir(conn, req, root, stats),
        Ok(OpCode::Rmdir) => handle_rmdir(conn, req, root, stats),
        Ok(OpCode::Create) => handle_create(conn, req, root, stats),
        Ok(OpCode::Read) => handle_read(conn, req, root, stats),
        Ok(OpCode::Write) => handle_write(conn, req, root, stats),
        Ok(OpCode::Truncate) => handle_truncate(conn, req, root, stats),
        Ok(OpCode::Unlink) => handle_unlink(conn, req, root, stats),
        Ok(OpCode::Rename) => handle_rename(conn, req, root, stats),
        Ok(OpCode::Chmod) => handle_chmod(conn, req, root, stats),
        Ok(OpCode::Utime) => handle_utime(conn, req, root, stats),
        Ok(OpCode::Statfs) => handle_statfs(conn, req, root, stats),
        _ => conn.send_response(&mut Response::error(libc::ENOSYS), stats),
    }
}

fn handle_getattr(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => match nix::sys::stat::lstat(&path) {
            Ok(st) => {
                let mut r = Response::empty_ok();
                r.set_payload(attr_from_stat(&st).as_bytes());
                r
            }
            Err(e) => Response::error(e as i32),
        },
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_mkdir(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => {
            let mode = nix::sys::stat::Mode::from_bits_truncate(req.mode as libc::mode_t);
            match nix::sys::stat::mkdirat(nix::fcntl::AT_FDCWD, &path, mode) {
                Ok(()) => Response::empty_ok(),
                Err(e) => Response::error(e as i32),
            }
        }
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_readdir(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let path = match resolve_or_errno(root, req) {
        Ok(p) => p,
        Err(errno) => return conn.send_response(&mut Response::error(errno), stats),
    };
    let read_dir = match std::fs::read_dir(&path) {
        Ok(it) => it,
        Err(e) => return conn.send_response(&mut Response::error(io_errno(&e)), stats),
    };

    // `std::fs::read_dir` drops `.`/`..`, unlike the raw `readdir()` stream the
    // reference server forwards verbatim; put them back so the client sees the same
    // two leading entries a real filesystem would.
    let mut entries: Vec<(std::ffi::OsString, FileKind)> =
        vec![(".".into(), FileKind::Directory), ("..".into(), FileKind::Directory)];
    entries.extend(read_dir.filter_map(|e| e.ok()).map(|e| {
        let kind = e.file_type().map(kind_from_file_type).unwrap_or(FileKind::Other);
        (e.file_name(), kind)
    }));

    // `.`/`..` keep `entries` non-empty even for a directory with no children, the
    // same guarantee the raw `readdir()` stream gives the reference server.
    let last = entries.len() - 1;
    for (i, (name, kind)) in entries.into_iter().enumerate() {
        let wire = DirEntryWire::new(&name, kind, 0)
            .unwrap_or_else(|_| DirEntryWire::new(OsStr::new(""), FileKind::Other, 0).unwrap());
        let mut resp = Response::empty_ok();
        resp.set_payload(wire.as_bytes());
        resp.endofdata = if i == last { 1 } else { 0 };
        conn.send_response(&mut resp, stats)?;
    }
    Ok(())
}

fn handle_rmdir(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => match std::fs::remove_dir(&path) {
            Ok(()) => Response::empty_ok(),
            Err(e) => Response::error(io_errno(&e)),
        },
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_create(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true).custom_flags(req.flags);
            debug!("create {:?}", path);
            match opts.open(&path) {
                Ok(file) => {
                    let _ = file.set_permissions(std::fs::Permissions::from_mode(req.mode));
                    Response::empty_ok()
                }
                Err(e) => Response::error(io_errno(&e)),
            }
        }
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_read(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut file = match resolve_or_errno(root, req).and_then(|path| {
        std::fs::File::open(&path).map_err(|e| io_errno(&e))
    }) {
        Ok(f) => f,
        Err(errno) => return conn.send_response(&mut Response::error(errno), stats),
    };

    if req.offset != 0 {
        if let Err(e) = file.seek(SeekFrom::Start(req.offset as u64)) {
            return conn.send_response(&mut Response::error(io_errno(&e)), stats);
        }
    }

    let mut remaining = req.size as usize;
    let mut buf = [0u8; DATA_SIZE];
    loop {
        let want = remaining.min(DATA_SIZE);
        if want == 0 {
            let mut resp = Response::empty_ok();
            resp.endofdata = 1;
            return conn.send_response(&mut resp, stats);
        }
        match file.read(&mut buf[..want]) {
            Ok(0) => {
                let mut resp = Response::empty_ok();
                resp.endofdata = 1;
                return conn.send_response(&mut resp, stats);
            }
            Ok(n) => {
                remaining -= n;
                let mut resp = Response::empty_ok();
                resp.set_payload(&buf[..n]);
                resp.endofdata = if n < want || remaining == 0 { 1 } else { 0 };
                let done = resp.endofdata == 1;
                conn.send_response(&mut resp, stats)?;
                if done {
                    return Ok(());
                }
            }
            Err(e) => {
                let mut resp = Response::error(io_errno(&e));
                return conn.send_response(&mut resp, stats);
            }
        }
    }
}

fn handle_write(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut file = match resolve_or_errno(root, req).and_then(|path| {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| io_errno(&e))
    }) {
        Ok(f) => f,
        Err(errno) => return conn.send_response(&mut Response::error(errno), stats),
    };

    if req.offset != 0 {
        if let Err(e) = file.seek(SeekFrom::Start(req.offset as u64)) {
            return conn.send_response(&mut Response::error(io_errno(&e)), stats);
        }
    }

    // Tell the client it may start streaming data frames.
    conn.send_response(&mut Response::empty_ok(), stats)?;

    let mut total: u64 = 0;
    let mut write_error: Option<i32> = None;
    loop {
        let chunk = conn.recv_request(stats)?;
        if write_error.is_none() {
            match file.write_all(chunk.payload()) {
                Ok(()) => total += chunk.payload().len() as u64,
                Err(e) => write_error = Some(io_errno(&e)),
            }
        }
        if chunk.endofdata != 0 {
            break;
        }
    }

    let mut resp = match write_error {
        Some(errno) => Response::error(errno),
        None => {
            let mut r = Response::empty_ok();
            r.size = total;
            r
        }
    };
    conn.send_response(&mut resp, stats)
}

fn handle_truncate(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => match nix::unistd::truncate(&path, req.truncate_len) {
            Ok(()) => Response::empty_ok(),
            Err(e) => Response::error(e as i32),
        },
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_unlink(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => match std::fs::remove_file(&path) {
            Ok(()) => Response::empty_ok(),
            Err(e) => Response::error(io_errno(&e)),
        },
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_rename(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = 'resolve: {
        let url = match req.url() {
            Ok(u) => u,
            Err(_) => break 'resolve Response::error(libc::EINVAL),
        };
        let uri = match req.uri() {
            Ok(u) => u,
            Err(_) => break 'resolve Response::error(libc::EINVAL),
        };
        let new_uri = match req.data_path() {
            Ok(u) => u,
            Err(_) => break 'resolve Response::error(libc::EINVAL),
        };
        let from = match resolve_checked(root, url, uri) {
            Ok(p) => p,
            Err(e) => break 'resolve Response::error(io_errno(&e)),
        };
        let to = match resolve_checked(root, url, new_uri) {
            Ok(p) => p,
            Err(e) => break 'resolve Response::error(io_errno(&e)),
        };
        match std::fs::rename(&from, &to) {
            Ok(()) => Response::empty_ok(),
            Err(e) => Response::error(io_errno(&e)),
        }
    };
    conn.send_response(&mut resp, stats)
}

fn handle_chmod(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => match std::fs::set_permissions(&path, std::fs::Permissions::from_mode(req.mode)) {
            Ok(()) => Response::empty_ok(),
            Err(e) => Response::error(io_errno(&e)),
        },
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

/// Sets both access and modification time to "now". The reference server passed an
/// uninitialized local buffer to `utime(2)`, setting garbage timestamps; this
/// updates to the current time instead, the conventional meaning of a bare `utime`
/// call with no explicit timestamps.
fn handle_utime(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => {
            let now = nix::sys::time::TimeSpec::new(0, libc::UTIME_NOW as i64);
            match nix::sys::stat::utimensat(
                nix::fcntl::AT_FDCWD,
                &path,
                &now,
                &now,
                nix::sys::stat::UtimensatFlags::FollowSymlink,
            ) {
                Ok(()) => {
                    let secs = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    let mut r = Response::empty_ok();
                    r.set_payload(
                        TimesWire {
                            atime_secs: secs,
                            mtime_secs: secs,
                        }
                        .as_bytes(),
                    );
                    r
                }
                Err(e) => Response::error(e as i32),
            }
        }
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}

fn handle_statfs(conn: &mut Connection, req: &Request, root: &Path, stats: Option<&SharedStats>) -> io::Result<()> {
    let mut resp = match resolve_or_errno(root, req) {
        Ok(path) => match nix::sys::statvfs::statvfs(&path) {
            Ok(st) => {
                let mut r = Response::empty_ok();
                r.set_payload(
                    StatfsWire {
                        blocks: st.blocks(),
                        bfree: st.blocks_free(),
                        bavail: st.blocks_available(),
                        files: st.files(),
                        ffree: st.files_free(),
                        bsize: st.block_size() as u32,
                        namelen: st.name_max() as u32,
                    }
                    .as_bytes(),
                );
                r
            }
            Err(e) => Response::error(e as i32),
        },
        Err(errno) => Response::error(errno),
    };
    conn.send_response(&mut resp, stats)
}
