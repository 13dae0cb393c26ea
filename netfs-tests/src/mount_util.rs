//! Waiting for and recognizing a live FUSE mount via `/proc/mounts`.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::bail;

use crate::command_utils::command_output;

fn is_fuse_mount_at(mounts: &str, mountpoint: &Path) -> bool {
    let target = mountpoint.to_string_lossy();
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let Some(mp) = fields.next() else { return false };
        let Some(fstype) = fields.next() else { return false };
        mp == target && fstype.starts_with("fuse")
    })
}

pub(crate) async fn wait_for_fuse_mount(mountpoint: &Path) -> anyhow::Result<()> {
    eprintln!("Waiting for mount at {:?}...", mountpoint);
    let start = Instant::now();
    loop {
        let mounts = command_output(["cat", "/proc/mounts"]).await?;
        if is_fuse_mount_at(&mounts, mountpoint) {
            return Ok(());
        }
        if start.elapsed() > Duration::from_secs(5) {
            bail!("timed out waiting for FUSE mount at {:?}", mountpoint);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
