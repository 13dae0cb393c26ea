//! The `fuser::Filesystem` implementation: every kernel callback becomes one
//! (occasionally multi-frame) request/response exchange over a fresh TCP
//! connection, mirroring the reference client's one-connection-per-call design —
//! there is no connection pooling or request pipelining.

use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request as FuseRequest, TimeOrNow,
};

use crate::client::inode_table::{InodeTable, ROOT_INO};
use crate::proto::{DirEntryWire, FileAttrWire, FileKind, OpCode, Request, StatfsWire, DATA_SIZE};
use crate::transport::Connection;

const TTL: Duration = Duration::from_secs(1);

pub struct RemoteFilesystem {
    addr: SocketAddr,
    url: String,
    inodes: Mutex<InodeTable>,
}

impl RemoteFilesystem {
    pub fn new(addr: SocketAddr, url: String) -> Self {
        RemoteFilesystem {
            addr,
            url,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn connect(&self) -> std::io::Result<Connection> {
        Connection::connect(self.addr)
    }

    fn uri_for(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().unwrap().path(ino).map(Path::to_path_buf)
    }

    fn child_uri(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.inodes.lock().unwrap().child_path(parent, name)
    }

    fn intern(&self, path: PathBuf) -> u64 {
        self.inodes.lock().unwrap().intern(path)
    }

    fn parent_ino(&self, ino: u64) -> u64 {
        self.inodes.lock().unwrap().parent_ino(ino).unwrap_or(ROOT_INO)
    }

    fn build_request(&self, op: OpCode, uri: &Path) -> Option<Request> {
        Request::new(op, OsStr::new(&self.url), uri.as_os_str()).ok()
    }

    fn to_file_attr(ino: u64, wire: &FileAttrWire) -> FileAttr {
        FileAttr {
            ino,
            size: wire.size,
            blocks: wire.blocks,
            atime: secs_to_systemtime(wire.atime_secs),
            mtime: secs_to_systemtime(wire.mtime_secs),
            ctime: secs_to_systemtime(wire.ctime_secs),
            crtime: secs_to_systemtime(wire.ctime_secs),
            kind: to_file_type(wire.kind()),
            perm: (wire.mode & 0o7777) as u16,
            nlink: wire.nlink,
            uid: wire.uid,
            gid: wire.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    /// GETATTR round trip, used both directly and as the follow-up after
    /// MKDIR/CREATE so the kernel gets attributes for the entry it just made.
    fn fetch_attr(&self, ino: u64, uri: &Path) -> Result<FileAttr, i32> {
        let mut req = self.build_request(OpCode::Getattr, uri).ok_or(libc::EINVAL)?;
        let mut conn = self.connect().map_err(io_errno)?;
        conn.send_request(&mut req).map_err(io_errno)?;
        let resp = conn.recv_response().map_err(io_errno)?;
        if !resp.is_success() {
            return Err(resp.errcode);
        }
        let wire = FileAttrWire::read_from_bytes(resp.payload()).map_err(|_| libc::EIO)?;
        Ok(Self::to_file_attr(ino, &wire))
    }
}

fn io_errno(e: std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn secs_to_systemtime(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::RegularFile | FileKind::Other => FileType::RegularFile,
    }
}

use zerocopy::FromBytes;

impl Filesystem for RemoteFilesystem {
    fn lookup(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(uri) = self.child_uri(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ino = self.intern(uri.clone());
        match self.fetch_attr(ino, &uri) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &FuseRequest<'_>, ino: u64, reply: ReplyAttr) {
        let Some(uri) = self.uri_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fetch_attr(ino, &uri) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(uri) = self.uri_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(mode) = mode {
            if let Some(errno) = self.simple_op(OpCode::Chmod, &uri, |r| r.mode = mode) {
                reply.error(errno);
                return;
            }
        }
        if let Some(size) = size {
            if let Some(errno) =
                self.simple_op(OpCode::Truncate, &uri, |r| r.truncate_len = size as i64)
            {
                reply.error(errno);
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Some(errno) = self.simple_op(OpCode::Utime, &uri, |_| {}) {
                reply.error(errno);
                return;
            }
        }

        match self.fetch_attr(ino, &uri) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(uri) = self.child_uri(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(errno) = self.simple_op(OpCode::Mkdir, &uri, |r| r.mode = mode) {
            reply.error(errno);
            return;
        }
        let ino = self.intern(uri.clone());
        match self.fetch_attr(ino, &uri) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(uri) = self.child_uri(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(errno) = self.simple_op(OpCode::Create, &uri, |r| {
            r.mode = mode;
            r.flags = flags;
        }) {
            reply.error(errno);
            return;
        }
        let ino = self.intern(uri.clone());
        match self.fetch_attr(ino, &uri) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(uri) = self.child_uri(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.simple_op(OpCode::Unlink, &uri, |_| {}) {
            None => reply.ok(),
            Some(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &FuseRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(uri) = self.child_uri(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.simple_op(OpCode::Rmdir, &uri, |_| {}) {
            None => reply.ok(),
            Some(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &FuseRequest<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(uri), Some(new_uri)) = (
            self.child_uri(parent, name),
            self.child_uri(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };

        let Some(mut req) = self.build_request(OpCode::Rename, &uri) else {
            reply.error(libc::EINVAL);
            return;
        };
        if req.set_data_path(new_uri.as_os_str()).is_err() {
            reply.error(libc::ENAMETOOLONG);
            return;
        }
        match self.roundtrip(&mut req) {
            Ok(resp) if resp.is_success() => {
                self.inodes.lock().unwrap().intern(new_uri);
                reply.ok();
            }
            Ok(resp) => reply.error(resp.errcode),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &FuseRequest<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn release(
        &mut self,
        _req: &FuseRequest<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &FuseRequest<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &FuseRequest<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn access(&mut self, _req: &FuseRequest<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(uri) = self.uri_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(mut req) = self.build_request(OpCode::Read, &uri) else {
            reply.error(libc::EINVAL);
            return;
        };
        req.offset = offset;
        req.size = size as u64;

        let mut conn = match self.connect() {
            Ok(c) => c,
            Err(e) => {
                reply.error(io_errno(e));
                return;
            }
        };
        if let Err(e) = conn.send_request(&mut req) {
            reply.error(io_errno(e));
            return;
        }

        let mut buf = Vec::with_capacity(size as usize);
        loop {
            let resp = match conn.recv_response() {
                Ok(r) => r,
                Err(e) => {
                    reply.error(io_errno(e));
                    return;
                }
            };
            if !resp.is_success() {
                reply.error(resp.errcode);
                return;
            }
            buf.extend_from_slice(resp.payload());
            if resp.endofdata != 0 {
                break;
            }
        }
        reply.data(&buf);
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(uri) = self.uri_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(mut req) = self.build_request(OpCode::Write, &uri) else {
            reply.error(libc::EINVAL);
            return;
        };
        req.offset = offset;
        req.size = data.len() as u64;

        let mut conn = match self.connect() {
            Ok(c) => c,
            Err(e) => {
                reply.error(io_errno(e));
                return;
            }
        };
        if let Err(e) = conn.send_request(&mut req) {
            reply.error(io_errno(e));
            return;
        }

        let ready = match conn.recv_response() {
            Ok(r) => r,
            Err(e) => {
                reply.error(io_errno(e));
                return;
            }
        };
        if !ready.is_success() {
            reply.error(ready.errcode);
            return;
        }

        let mut sent = 0usize;
        loop {
            let chunk_len = (data.len() - sent).min(DATA_SIZE);
            let last = sent + chunk_len >= data.len();
            req.data[..chunk_len].copy_from_slice(&data[sent..sent + chunk_len]);
            if chunk_len < data.len() {
                req.data[chunk_len..].fill(0);
            }
            req.size = chunk_len as u64;
            req.endofdata = if last { 1 } else { 0 };
            if let Err(e) = conn.send_request(&mut req) {
                reply.error(io_errno(e));
                return;
            }
            sent += chunk_len;
            if last {
                break;
            }
        }

        match conn.recv_response() {
            Ok(resp) if resp.is_success() => reply.written(resp.size as u32),
            Ok(resp) => reply.error(resp.errcode),
            Err(e) => reply.error(io_errno(e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &FuseRequest<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(uri) = self.uri_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(mut req) = self.build_request(OpCode::Readdir, &uri) else {
            reply.error(libc::EINVAL);
            return;
        };

        let mut conn = match self.connect() {
            Ok(c) => c,
            Err(e) => {
                reply.error(io_errno(e));
                return;
            }
        };
        if let Err(e) = conn.send_request(&mut req) {
            reply.error(io_errno(e));
            return;
        }

        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = Vec::new();
        loop {
            let resp = match conn.recv_response() {
                Ok(r) => r,
                Err(e) => {
                    reply.error(io_errno(e));
                    return;
                }
            };
            if !resp.is_success() {
                if resp.errcode != 0 {
                    reply.error(resp.errcode);
                    return;
                }
                break; // empty directory
            }
            if let Ok(wire) = DirEntryWire::read_from_bytes(resp.payload()) {
                if let Ok(name) = wire.name() {
                    // `.` and `..` name this directory and its parent respectively,
                    // not a child under `uri`; resolve them through the inode table
                    // instead of joining them as a path component.
                    let entry_ino = if name == OsStr::new(".") {
                        ino
                    } else if name == OsStr::new("..") {
                        self.parent_ino(ino)
                    } else {
                        self.intern(uri.join(name))
                    };
                    entries.push((entry_ino, to_file_type(wire.kind()), name.to_owned()));
                }
            }
            if resp.endofdata != 0 {
                break;
            }
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &FuseRequest<'_>, ino: u64, reply: ReplyStatfs) {
        let Some(uri) = self.uri_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(mut req) = self.build_request(OpCode::Statfs, &uri) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.roundtrip(&mut req) {
            Ok(resp) if resp.is_success() => match StatfsWire::read_from_bytes(resp.payload()) {
                Ok(wire) => reply.statfs(
                    wire.blocks,
                    wire.bfree,
                    wire.bavail,
                    wire.files,
                    wire.ffree,
                    wire.bsize,
                    wire.namelen,
                    wire.bsize,
                ),
                Err(_) => reply.error(libc::EIO),
            },
            Ok(resp) => reply.error(resp.errcode),
            Err(errno) => reply.error(errno),
        }
    }
}

impl RemoteFilesystem {
    fn roundtrip(&self, req: &mut Request) -> Result<crate::proto::Response, i32> {
        let mut conn = self.connect().map_err(io_errno)?;
        conn.send_request(req).map_err(io_errno)?;
        conn.recv_response().map_err(io_errno)
    }

    /// Send a request built from `uri` through `customize`, returning `None` on
    /// success or `Some(errno)` on failure. Used for the fire-and-forget opcodes
    /// that reply with just a status.
    fn simple_op(&self, op: OpCode, uri: &Path, customize: impl FnOnce(&mut Request)) -> Option<i32> {
        let mut req = self.build_request(op, uri)?;
        customize(&mut req);
        match self.roundtrip(&mut req) {
            Ok(resp) if resp.is_success() => None,
            Ok(resp) => Some(resp.errcode),
            Err(errno) => Some(errno),
        }
    }
}

