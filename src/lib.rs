//! `netfs` — a networked POSIX filesystem bridge: `netfs-mount` projects a remote
//! directory tree through FUSE, forwarding every operation over TCP to `netfsd`,
//! which performs the real syscall locally and streams the result back.

pub mod client;
pub mod error;
pub mod mount_arg;
pub mod path_resolve;
pub mod proto;
pub mod rate;
pub mod server;
pub mod stats;
pub mod transport;
