//! TCP transport and the per-frame nonce handshake.
//!
//! Every frame exchange is: the sender fills a random nonce, writes the fixed-size
//! frame, the receiver reads the full frame and echoes the nonce back as a bare
//! `u32`, and the sender reads that echo back and compares it. A mismatch is logged
//! but never fatal — it is a frame-desynchronization detector, not an authentication
//! mechanism.

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};

use log::warn;
use zerocopy::{FromBytes, IntoBytes};

use crate::proto::{Request, Response};
use crate::stats::SharedStats;

/// One TCP connection, used for exactly one client-initiated operation.
pub struct Connection {
    stream: TcpStream,
}

fn read_exact_retrying(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<()> {
    // Frames are fixed size with no length prefix; a short read must be retried
    // until the full frame is consumed. `read_exact` already loops internally, but
    // we want a clean "peer hung up mid frame" error distinct from other I/O errors.
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            "peer closed connection mid-frame",
        )),
        Err(e) => Err(e),
    }
}

fn random_nonce() -> u32 {
    // A cheap liveness/frame-boundary check, not a security property. Reading a
    // word from /dev/urandom sidesteps having to manage a PRNG seed across forked
    // children.
    let mut bytes = [0u8; 4];
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .expect("/dev/urandom must be available and readable");
    u32::from_ne_bytes(bytes)
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Connection { stream }
    }

    pub fn connect(addr: std::net::SocketAddr) -> io::Result<Self> {
        Ok(Connection::new(TcpStream::connect(addr)?))
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Send a request frame (client side): fill its nonce, write it, then read the
    /// echoed nonce back and compare.
    pub fn send_request(&mut self, req: &mut Request) -> io::Result<()> {
        req.nonce = random_nonce();
        self.stream.write_all(req.as_bytes())?;
        let echoed = self.read_nonce_echo()?;
        if echoed != req.nonce {
            warn!(
                "nonce mismatch on request send: sent {}, echoed {}",
                req.nonce, echoed
            );
        }
        Ok(())
    }

    /// Receive a request frame (server side): read it, then echo its nonce back.
    pub fn recv_request(&mut self, stats: Option<&SharedStats>) -> io::Result<Request> {
        let mut buf = [0u8; std::mem::size_of::<Request>()];
        read_exact_retrying(&mut self.stream, &mut buf)?;
        let req = Request::read_from_bytes(&buf).expect("buffer is exactly sizeof::<Request>()");
        self.write_nonce_echo(req.nonce)?;
        if let Some(stats) = stats {
            stats.record_received(buf.len() as u64);
        }
        Ok(req)
    }

    /// Send a response frame (server side): fill its nonce, write it, then read the
    /// echoed nonce back and compare.
    pub fn send_response(&mut self, resp: &mut Response, stats: Option<&SharedStats>) -> io::Result<()> {
        resp.nonce = random_nonce();
        self.stream.write_all(resp.as_bytes())?;
        let echoed = self.read_nonce_echo()?;
        if echoed != resp.nonce {
            warn!(
                "nonce mismatch on response send: sent {}, echoed {}",
                resp.nonce, echoed
            );
        }
        if let Some(stats) = stats {
            stats.record_sent(std::mem::size_of::<Response>() as u64);
        }
        Ok(())
    }

    /// Receive a response frame (client side): read it, then echo its nonce back.
    pub fn recv_response(&mut self) -> io::Result<Response> {
        let mut buf = [0u8; std::mem::size_of::<Response>()];
        read_exact_retrying(&mut self.stream, &mut buf)?;
        let resp = Response::read_from_bytes(&buf).expect("buffer is exactly sizeof::<Response>()");
        self.write_nonce_echo(resp.nonce)?;
        Ok(resp)
    }

    fn read_nonce_echo(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        read_exact_retrying(&mut self.stream, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn write_nonce_echo(&mut self, nonce: u32) -> io::Result<()> {
        self.stream.write_all(&nonce.to_ne_bytes())
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::OpCode;
    use std::ffi::OsStr;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn request_response_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut conn = Connection::new(stream);
            let req = conn.recv_request(None).unwrap();
            assert_eq!(req.opcode().unwrap(), OpCode::Getattr);
            let mut resp = Response::empty_ok();
            conn.send_response(&mut resp, None).unwrap();
        });

        let mut client = Connection::connect(addr).unwrap();
        let mut req = Request::new(OpCode::Getattr, OsStr::new("/export"), OsStr::new("/x")).unwrap();
        client.send_request(&mut req).unwrap();
        let resp = client.recv_response().unwrap();
        assert!(resp.is_success());

        server.join().unwrap();
    }
}
