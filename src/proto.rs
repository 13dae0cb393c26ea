//! Wire protocol: fixed-layout request/response frames exchanged between
//! `netfs-mount` and `netfsd` over a short-lived TCP connection.
//!
//! Frames are fixed size and transmitted in host-platform layout (see the
//! homogeneous-endianness assumption in the design notes); there is no length
//! prefix because the receiver always knows the exact frame size up front.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum length (including the NUL terminator) of the exported root label.
pub const URL_LEN: usize = 80;
/// Maximum length (including the NUL terminator) of the path relative to the mount.
pub const URI_LEN: usize = 160;
/// Size of the inline payload buffer carried by every frame.
pub const DATA_SIZE: usize = 1024;

/// Default TCP port the server listens on.
pub const SERVER_PORT: u16 = 5001;

/// Operation codes. Order is fixed for binary compatibility: do not reorder or
/// insert variants, only append before a major version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum OpCode {
    Unknown = 0,
    Getattr,
    Access,
    Mkdir,
    Opendir,
    Readdir,
    Releasedir,
    Rmdir,
    Create,
    Open,
    Read,
    Write,
    Truncate,
    Release,
    Unlink,
    Rename,
    Chmod,
    Utime,
    Statfs,
}

/// Error parsing or constructing a frame field.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("string of {len} bytes does not fit in a {cap}-byte field")]
    TooLong { len: usize, cap: usize },
    #[error("field contains an interior NUL byte")]
    InteriorNul,
    #[error("field is not NUL-terminated")]
    NotTerminated,
    #[error("unknown operation code {0}")]
    UnknownOpCode(i32),
}

fn write_fixed(dst: &mut [u8], s: &OsStr) -> Result<(), ProtoError> {
    let bytes = s.as_bytes();
    if bytes.len() + 1 > dst.len() {
        return Err(ProtoError::TooLong {
            len: bytes.len(),
            cap: dst.len() - 1,
        });
    }
    if bytes.contains(&0) {
        return Err(ProtoError::InteriorNul);
    }
    dst.fill(0);
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_fixed(src: &[u8]) -> Result<&OsStr, ProtoError> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtoError::NotTerminated)?;
    Ok(OsStr::from_bytes(&src[..end]))
}

/// Request frame, sent client to server.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Request {
    pub nonce: u32,
    pub op: i32,
    url: [u8; URL_LEN],
    uri: [u8; URI_LEN],
    pub mode: u32,
    pub flags: i32,
    pub truncate_len: i64,
    pub size: u64,
    pub offset: i64,
    pub endofdata: u8,
    _pad: [u8; 7],
    pub data: [u8; DATA_SIZE],
}

impl Request {
    /// Build a zeroed request for `op` targeting `url`/`uri`.
    pub fn new(op: OpCode, url: &OsStr, uri: &OsStr) -> Result<Self, ProtoError> {
        let mut req = Request {
            nonce: 0,
            op: op.into(),
            url: [0; URL_LEN],
            uri: [0; URI_LEN],
            mode: 0,
            flags: 0,
            truncate_len: 0,
            size: 0,
            offset: 0,
            endofdata: 0,
            _pad: [0; 7],
            data: [0; DATA_SIZE],
        };
        write_fixed(&mut req.url, url)?;
        write_fixed(&mut req.uri, uri)?;
        Ok(req)
    }

    pub fn url(&self) -> Result<&OsStr, ProtoError> {
        read_fixed(&self.url)
    }

    pub fn uri(&self) -> Result<&OsStr, ProtoError> {
        read_fixed(&self.uri)
    }

    /// Set the inline `data` payload to a NUL-terminated path (used by RENAME's
    /// destination field).
    pub fn set_data_path(&mut self, path: &OsStr) -> Result<(), ProtoError> {
        write_fixed(&mut self.data, path)
    }

    pub fn data_path(&self) -> Result<&OsStr, ProtoError> {
        read_fixed(&self.data)
    }

    pub fn opcode(&self) -> Result<OpCode, ProtoError> {
        OpCode::try_from(self.op).map_err(|_| ProtoError::UnknownOpCode(self.op))
    }

    /// Slice of `data` actually carrying payload, per `size` (bounded to the buffer).
    pub fn payload(&self) -> &[u8] {
        let n = (self.size as usize).min(DATA_SIZE);
        &self.data[..n]
    }
}

/// Response status.
pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_FAIL: i32 = -1;

/// Response frame, sent server to client.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Response {
    pub nonce: u32,
    pub status: i32,
    pub errcode: i32,
    _pad_before_size: [u8; 4],
    pub size: u64,
    pub endofdata: u8,
    _pad: [u8; 7],
    pub data: [u8; DATA_SIZE],
}

impl Response {
    pub fn empty_ok() -> Self {
        Response {
            nonce: 0,
            status: STATUS_SUCCESS,
            errcode: 0,
            _pad_before_size: [0; 4],
            size: 0,
            endofdata: 1,
            _pad: [0; 7],
            data: [0; DATA_SIZE],
        }
    }

    pub fn error(errno: i32) -> Self {
        Response {
            nonce: 0,
            status: STATUS_FAIL,
            errcode: errno,
            _pad_before_size: [0; 4],
            size: 0,
            endofdata: 1,
            _pad: [0; 7],
            data: [0; DATA_SIZE],
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Copy `bytes` into `data`, setting `size`. Panics if `bytes` is larger than
    /// `DATA_SIZE`; callers chunk writes to `DATA_SIZE` before calling this.
    pub fn set_payload(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= DATA_SIZE);
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data[bytes.len()..].fill(0);
        self.size = bytes.len() as u64;
    }

    pub fn payload(&self) -> &[u8] {
        let n = (self.size as usize).min(DATA_SIZE);
        &self.data[..n]
    }
}

/// File kind, as carried in [`FileAttrWire::kind`]. Mirrors `fuser::FileType` without
/// depending on it from the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FileKind {
    RegularFile = 0,
    Directory = 1,
    Symlink = 2,
    Other = 3,
}

/// Attribute payload carried in the `data` field of a GETATTR/CREATE/MKDIR response.
/// Deliberately independent of `libc::stat`'s platform layout: both ends of the wire
/// are this crate, so there is no reason to ship raw, unportable `struct stat` bytes.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FileAttrWire {
    pub size: u64,
    pub blocks: u64,
    pub atime_secs: i64,
    pub mtime_secs: i64,
    pub ctime_secs: i64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub kind: u8,
    _pad: [u8; 7],
}

impl FileAttrWire {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        size: u64,
        blocks: u64,
        atime_secs: i64,
        mtime_secs: i64,
        ctime_secs: i64,
        mode: u32,
        nlink: u32,
        uid: u32,
        gid: u32,
        kind: u8,
    ) -> Self {
        FileAttrWire {
            size,
            blocks,
            atime_secs,
            mtime_secs,
            ctime_secs,
            mode,
            nlink,
            uid,
            gid,
            kind,
            _pad: [0; 7],
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::try_from(self.kind).unwrap_or(FileKind::Other)
    }
}

/// `statvfs(2)` summary carried in a STATFS response.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StatfsWire {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// One directory entry carried in a READDIR response frame; `endofdata` on the
/// enclosing [`Response`] marks the last entry of a listing.
pub const DIRENT_NAME_LEN: usize = 236;

#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct DirEntryWire {
    pub kind: u8,
    _pad: [u8; 7],
    pub ino_hint: u64,
    pub name: [u8; DIRENT_NAME_LEN],
    _pad2: [u8; 4],
}

impl DirEntryWire {
    pub fn new(name: &OsStr, kind: FileKind, ino_hint: u64) -> Result<Self, ProtoError> {
        let mut entry = DirEntryWire {
            kind: kind.into(),
            _pad: [0; 7],
            ino_hint,
            name: [0; DIRENT_NAME_LEN],
            _pad2: [0; 4],
        };
        write_fixed(&mut entry.name, name)?;
        Ok(entry)
    }

    pub fn name(&self) -> Result<&OsStr, ProtoError> {
        read_fixed(&self.name)
    }

    pub fn kind(&self) -> FileKind {
        FileKind::try_from(self.kind).unwrap_or(FileKind::Other)
    }
}

/// Timestamp pair carried in a UTIME response, reporting the access/modify times the
/// server actually applied.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TimesWire {
    pub atime_secs: i64,
    pub mtime_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use zerocopy::IntoBytes as _;

    #[test]
    fn request_roundtrips_fixed_fields() {
        let req = Request::new(OpCode::Getattr, OsStr::new("/export"), OsStr::new("/a/b")).unwrap();
        assert_eq!(req.url().unwrap(), OsStr::new("/export"));
        assert_eq!(req.uri().unwrap(), OsStr::new("/a/b"));
        assert_eq!(req.opcode().unwrap(), OpCode::Getattr);
    }

    #[test]
    fn request_rejects_oversize_uri() {
        let long = "x".repeat(URI_LEN);
        let err = Request::new(OpCode::Getattr, OsStr::new("/export"), OsStr::new(&long));
        assert!(matches!(err, Err(ProtoError::TooLong { .. })));
    }

    #[test]
    fn request_is_exact_wire_size() {
        let req = Request::new(OpCode::Getattr, OsStr::new(""), OsStr::new("")).unwrap();
        let bytes = req.as_bytes();
        assert_eq!(
            bytes.len(),
            4 + 4 + URL_LEN + URI_LEN + 4 + 4 + 8 + 8 + 8 + 1 + 7 + DATA_SIZE
        );
    }

    #[test]
    fn response_is_exact_wire_size() {
        let resp = Response::empty_ok();
        assert_eq!(resp.as_bytes().len(), 4 + 4 + 4 + 4 + 8 + 1 + 7 + DATA_SIZE);
    }

    #[test]
    fn response_set_payload_updates_size() {
        let mut resp = Response::empty_ok();
        resp.set_payload(b"hello");
        assert_eq!(resp.size, 5);
        assert_eq!(&resp.payload(), b"hello");
    }

    #[test]
    fn opcode_order_is_fixed_for_abi_compat() {
        assert_eq!(i32::from(OpCode::Unknown), 0);
        assert_eq!(i32::from(OpCode::Getattr), 1);
        assert_eq!(i32::from(OpCode::Statfs), 18);
    }

    #[test]
    fn dirent_wire_roundtrips_name_and_kind() {
        let entry = DirEntryWire::new(OsStr::new("notes.txt"), FileKind::RegularFile, 42).unwrap();
        assert_eq!(entry.name().unwrap(), OsStr::new("notes.txt"));
        assert_eq!(entry.kind(), FileKind::RegularFile);
        assert_eq!(entry.ino_hint, 42);
    }

    #[test]
    fn wire_payload_structs_fit_inline_data() {
        assert!(std::mem::size_of::<FileAttrWire>() <= DATA_SIZE);
        assert!(std::mem::size_of::<StatfsWire>() <= DATA_SIZE);
        assert!(std::mem::size_of::<DirEntryWire>() <= DATA_SIZE);
        assert!(std::mem::size_of::<TimesWire>() <= DATA_SIZE);
    }
}
