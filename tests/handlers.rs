//! End-to-end coverage of `netfs::server::handlers::dispatch` driven over a real
//! loopback TCP connection, one `Connection` per client-initiated operation, the
//! same shape the `netfsd` accept loop uses. No FUSE mount or kernel involvement;
//! this exercises the wire protocol and the server's local-filesystem handlers
//! directly, against a `tempfile::tempdir()` backing directory.

use std::ffi::OsStr;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};

use netfs::proto::{DirEntryWire, FileAttrWire, OpCode, Request, Response, DATA_SIZE};
use netfs::server::handlers::dispatch;
use netfs::transport::Connection;
use zerocopy::FromBytes;

/// Run one request against `root` over a fresh loopback connection and return every
/// response frame the handler sent back.
fn run(root: &Path, mut req: Request) -> Vec<Response> {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let root = root.to_path_buf();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut conn = Connection::new(stream);
        let req = conn.recv_request(None).unwrap();
        dispatch(&mut conn, &req, &root, None).unwrap();
    });

    let mut client = Connection::new(TcpStream::connect(addr).unwrap());
    client.send_request(&mut req).unwrap();

    let mut responses = Vec::new();
    loop {
        let resp = client.recv_response().unwrap();
        let done = resp.endofdata != 0;
        responses.push(resp);
        if done {
            break;
        }
    }

    server.join().unwrap();
    responses
}

/// Drive WRITE's two-phase protocol (announce, then stream `data` in `DATA_SIZE`
/// chunks) against `root`, returning the final response.
fn write_file(root: &Path, uri: &str, offset: i64, data: &[u8]) -> Response {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let root = root.to_path_buf();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut conn = Connection::new(stream);
        let req = conn.recv_request(None).unwrap();
        dispatch(&mut conn, &req, &root, None).unwrap();
    });

    let mut client = Connection::new(TcpStream::connect(addr).unwrap());
    let mut req = Request::new(OpCode::Write, OsStr::new(""), OsStr::new(uri)).unwrap();
    req.offset = offset;
    req.size = data.len() as u64;
    client.send_request(&mut req).unwrap();

    let ready = client.recv_response().unwrap();
    assert!(ready.is_success(), "server did not accept WRITE announcement");

    let mut sent = 0;
    loop {
        let chunk_len = (data.len() - sent).min(DATA_SIZE);
        let last = sent + chunk_len >= data.len();
        req.data[..chunk_len].copy_from_slice(&data[sent..sent + chunk_len]);
        req.data[chunk_len..].fill(0);
        req.size = chunk_len as u64;
        req.endofdata = if last { 1 } else { 0 };
        client.send_request(&mut req).unwrap();
        sent += chunk_len;
        if last {
            break;
        }
    }

    let result = client.recv_response().unwrap();
    server.join().unwrap();
    result
}

/// Drive READ's streaming response protocol, reassembling every chunk into one
/// buffer.
fn read_file(root: &Path, uri: &str, offset: i64, size: u64) -> (Vec<u8>, i32) {
    let mut req = Request::new(OpCode::Read, OsStr::new(""), OsStr::new(uri)).unwrap();
    req.offset = offset;
    req.size = size;

    let responses = run(root, req);
    let mut errno = 0;
    let mut buf = Vec::new();
    for resp in &responses {
        if !resp.is_success() {
            errno = resp.errcode;
            break;
        }
        buf.extend_from_slice(resp.payload());
    }
    (buf, errno)
}

fn getattr(root: &Path, uri: &str) -> Response {
    let req = Request::new(OpCode::Getattr, OsStr::new(""), OsStr::new(uri)).unwrap();
    run(root, req).into_iter().next().unwrap()
}

#[test]
fn getattr_round_trips_real_file_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("notes.txt"), b"hi").unwrap();

    let resp = getattr(tmp.path(), "/notes.txt");
    assert!(resp.is_success());
    let attr = FileAttrWire::read_from_bytes(resp.payload()).unwrap();
    assert_eq!(attr.size, 2);
}

#[test]
fn getattr_on_missing_path_returns_enoent() {
    let tmp = tempfile::tempdir().unwrap();
    let resp = getattr(tmp.path(), "/does-not-exist");
    assert!(!resp.is_success());
    assert_eq!(resp.errcode, libc::ENOENT);
}

#[test]
fn write_then_read_is_idempotent_for_a_small_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("small.txt");
    std::fs::write(&path, b"").unwrap();

    let resp = write_file(tmp.path(), "/small.txt", 0, b"hello, netfs");
    assert!(resp.is_success());
    assert_eq!(resp.size, 12);

    let (contents, errno) = read_file(tmp.path(), "/small.txt", 0, 12);
    assert_eq!(errno, 0);
    assert_eq!(contents, b"hello, netfs");
}

#[test]
fn write_then_read_crosses_the_data_size_chunk_boundary() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("big.bin");
    std::fs::write(&path, b"").unwrap();

    // Three and a half frames' worth, so both WRITE's chunking loop and READ's
    // chunking loop each cross a DATA_SIZE boundary more than once.
    let payload: Vec<u8> = (0..(DATA_SIZE * 3 + DATA_SIZE / 2))
        .map(|i| (i % 251) as u8)
        .collect();

    let resp = write_file(tmp.path(), "/big.bin", 0, &payload);
    assert!(resp.is_success());
    assert_eq!(resp.size, payload.len() as u64);

    let (contents, errno) = read_file(tmp.path(), "/big.bin", 0, payload.len() as u64);
    assert_eq!(errno, 0);
    assert_eq!(contents, payload);
}

#[test]
fn truncate_shrinks_a_file_and_getattr_reflects_the_new_size() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("shrink.bin");
    std::fs::write(&path, vec![7u8; 4096]).unwrap();

    let mut req = Request::new(OpCode::Truncate, OsStr::new(""), OsStr::new("/shrink.bin")).unwrap();
    req.truncate_len = 10;
    let resp = run(tmp.path(), req).into_iter().next().unwrap();
    assert!(resp.is_success());

    let attr_resp = getattr(tmp.path(), "/shrink.bin");
    let attr = FileAttrWire::read_from_bytes(attr_resp.payload()).unwrap();
    assert_eq!(attr.size, 10);
}

#[test]
fn mkdir_readdir_includes_dot_and_dotdot_then_rmdir() {
    let tmp = tempfile::tempdir().unwrap();

    let mkdir_req = Request::new(OpCode::Mkdir, OsStr::new(""), OsStr::new("/sub")).unwrap();
    let mkdir_resp = run(tmp.path(), mkdir_req).into_iter().next().unwrap();
    assert!(mkdir_resp.is_success());
    std::fs::write(tmp.path().join("sub/file.txt"), b"x").unwrap();

    let readdir_req = Request::new(OpCode::Readdir, OsStr::new(""), OsStr::new("/sub")).unwrap();
    let names: Vec<String> = run(tmp.path(), readdir_req)
        .iter()
        .filter(|r| r.is_success())
        .map(|r| {
            let wire = DirEntryWire::read_from_bytes(r.payload()).unwrap();
            wire.name().unwrap().to_string_lossy().into_owned()
        })
        .collect();
    assert!(names.contains(&".".to_string()), "missing '.': {names:?}");
    assert!(names.contains(&"..".to_string()), "missing '..': {names:?}");
    assert!(names.contains(&"file.txt".to_string()), "missing child: {names:?}");

    std::fs::remove_file(tmp.path().join("sub/file.txt")).unwrap();
    let rmdir_req = Request::new(OpCode::Rmdir, OsStr::new(""), OsStr::new("/sub")).unwrap();
    let rmdir_resp = run(tmp.path(), rmdir_req).into_iter().next().unwrap();
    assert!(rmdir_resp.is_success());
    assert!(!tmp.path().join("sub").exists());
}

#[test]
fn rename_moves_a_file_and_old_name_is_gone() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.txt"), b"content").unwrap();

    let mut req = Request::new(OpCode::Rename, OsStr::new(""), OsStr::new("/a.txt")).unwrap();
    req.set_data_path(OsStr::new("/b.txt")).unwrap();
    let resp = run(tmp.path(), req).into_iter().next().unwrap();
    assert!(resp.is_success());

    assert!(!tmp.path().join("a.txt").exists());
    assert_eq!(std::fs::read(tmp.path().join("b.txt")).unwrap(), b"content");
}

#[test]
fn create_then_unlink_round_trips() {
    let tmp = tempfile::tempdir().unwrap();

    let mut req = Request::new(OpCode::Create, OsStr::new(""), OsStr::new("/new.txt")).unwrap();
    req.mode = 0o644;
    let resp = run(tmp.path(), req).into_iter().next().unwrap();
    assert!(resp.is_success());
    assert!(tmp.path().join("new.txt").exists());

    let unlink_req = Request::new(OpCode::Unlink, OsStr::new(""), OsStr::new("/new.txt")).unwrap();
    let unlink_resp = run(tmp.path(), unlink_req).into_iter().next().unwrap();
    assert!(unlink_resp.is_success());
    assert!(!tmp.path().join("new.txt").exists());
}

#[test]
fn path_traversal_outside_the_export_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("export")).unwrap();

    let req = Request::new(OpCode::Getattr, OsStr::new("/export"), OsStr::new("/../../etc/passwd")).unwrap();
    let resp = run(tmp.path(), req).into_iter().next().unwrap();
    assert!(!resp.is_success());
}
