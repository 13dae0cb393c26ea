//! End-to-end test: export a temp directory with `netfsd`, mount it with
//! `netfs-mount`, and exercise the filesystem through the mount point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::fs;
use tokio::process::{Child, Command};

use crate::canonical_temp_dir::CanonicalTempDir;
use crate::command_utils::command_success;
use crate::mount_util::wait_for_fuse_mount;

async fn cargo_build_bin(bin: &str) -> anyhow::Result<PathBuf> {
    command_success(["cargo", "build", "--bin", bin]).await?;
    Ok(PathBuf::from(format!("target/debug/{bin}")))
}

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.start_kill();
    }
}

pub(crate) async fn run_roundtrip_test(cmethod: &str) -> anyhow::Result<()> {
    let export_dir = CanonicalTempDir::new()?;
    let mount_dir = CanonicalTempDir::new()?;

    eprintln!("Export dir: {:?}", export_dir.path());
    eprintln!("Mount dir: {:?}", mount_dir.path());

    let netfsd = cargo_build_bin("netfsd").await?;
    let netfs_mount = cargo_build_bin("netfs-mount").await?;

    eprintln!("Starting netfsd with concurrency method '{cmethod}'...");
    let server = ChildGuard(
        Command::new(&netfsd)
            .args([
                "export",
                "127.0.0.1",
                export_dir.path().to_str().unwrap(),
                "--cmethod",
                cmethod,
            ])
            .kill_on_drop(true)
            .spawn()
            .context("failed to start netfsd")?,
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    eprintln!("Starting netfs-mount...");
    let client = ChildGuard(
        Command::new(&netfs_mount)
            .args(["127.0.0.1", mount_dir.path().to_str().unwrap()])
            .kill_on_drop(true)
            .spawn()
            .context("failed to start netfs-mount")?,
    );

    wait_for_fuse_mount(mount_dir.path()).await?;

    let result = exercise_filesystem(mount_dir.path()).await;

    let _ = command_success(["fusermount", "-u", mount_dir.path().to_str().unwrap()]).await;
    drop(client);
    drop(server);

    result
}

async fn exercise_filesystem(mount_point: &std::path::Path) -> anyhow::Result<()> {
    eprintln!("Testing file create/write/read...");
    let file_path = mount_point.join("hello.txt");
    fs::write(&file_path, b"hello from netfs-tests").await?;
    let contents = fs::read(&file_path).await?;
    if contents != b"hello from netfs-tests" {
        bail!("read back unexpected contents: {:?}", contents);
    }

    eprintln!("Testing mkdir/readdir...");
    let dir_path = mount_point.join("subdir");
    fs::create_dir(&dir_path).await?;
    let nested = dir_path.join("nested.txt");
    fs::write(&nested, b"nested").await?;

    let mut names = Vec::new();
    let mut entries = fs::read_dir(mount_point).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    if !names.contains(&"hello.txt".to_string()) || !names.contains(&"subdir".to_string()) {
        bail!("readdir missing expected entries: {:?}", names);
    }

    eprintln!("Testing rename...");
    let renamed = mount_point.join("hello2.txt");
    fs::rename(&file_path, &renamed).await?;
    if fs::metadata(&file_path).await.is_ok() {
        bail!("old name still exists after rename");
    }
    fs::metadata(&renamed).await.context("renamed file should exist")?;

    eprintln!("Testing unlink/rmdir...");
    fs::remove_file(&nested).await?;
    fs::remove_dir(&dir_path).await?;
    fs::remove_file(&renamed).await?;

    eprintln!("Roundtrip test passed.");
    Ok(())
}
