//! Shell subprocess output source.
//!
//! Each collector's platform command runs under `sh -c` with stdout piped
//! back as raw chunks. Chunk boundaries follow the pipe's read granularity;
//! downstream parsing treats every chunk as a batch of whole lines, which
//! holds in practice because the wrapped tools are line-buffered.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

const READ_BUF_SIZE: usize = 8192;
const CHANNEL_CAPACITY: usize = 64;

/// A spawned shell command streaming stdout chunks over a channel.
pub struct ShellSource {
    child: Option<Child>,
}

impl ShellSource {
    /// Spawn `sh -c <cmd>` and return the source handle plus the receiving
    /// end of its stdout stream. The channel closes when the process exits
    /// or is terminated.
    pub fn spawn(cmd: &str) -> Result<(Self, mpsc::Receiver<String>)> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn: {cmd}"))?;

        let mut stdout = child
            .stdout
            .take()
            .context("child process has no stdout pipe")?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "stdout read failed, stream closed");
                        break;
                    }
                }
            }
        });

        Ok((Self { child: Some(child) }, rx))
    }

    /// Kill the subprocess. Idempotent; the kill signal is fire-and-forget
    /// and `kill_on_drop` covers the case where it could not be delivered.
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "failed to signal subprocess");
            }
        }
    }
}

impl Drop for ShellSource {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_streams_stdout() {
        let (_source, mut rx) = ShellSource::spawn("printf 'a b c\\n'").expect("spawn");

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected, "a b c\n");
    }

    #[tokio::test]
    async fn test_channel_closes_on_exit() {
        let (_source, mut rx) = ShellSource::spawn("true").expect("spawn");

        while rx.recv().await.is_some() {}
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (mut source, mut rx) = ShellSource::spawn("sleep 30").expect("spawn");

        source.terminate();
        source.terminate();

        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_multi_line_chunks_arrive_in_order() {
        let (_source, mut rx) =
            ShellSource::spawn("printf '1\\n'; printf '2\\n'; printf '3\\n'").expect("spawn");

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected, "1\n2\n3\n");
    }
}
