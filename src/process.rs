//! Supervision of external ffmpeg subprocesses.
//!
//! A [`ChildProcess`] exposes start, await-exit, graceful interrupt, kill and
//! an optional stream of stdout chunks. stderr is always drained into the log
//! so a chatty child can never block on a full pipe.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_stream::Stream;

use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 8192;

pub struct ChildProcess {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl ChildProcess {
    /// Spawns `program` with `args`. stdout is piped only when `capture_stdout` is set.
    pub fn spawn(label: &str, program: &str, args: &[String], capture_stdout: bool) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Recorder(format!("failed to spawn {} ({}): {}", label, program, e)))?;

        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", label, line);
                }
            });
        }

        debug!("Spawned {} (pid {:?})", label, child.id());
        Ok(ChildProcess {
            label: label.to_string(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
        })
    }

    /// Raw stdout as a stream of chunks. Yields `None` if stdout was not captured
    /// or has already been taken.
    pub fn take_stdout(&mut self) -> Option<impl Stream<Item = io::Result<Bytes>>> {
        let mut stdout = self.stdout.take()?;
        Some(async_stream::try_stream! {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        })
    }

    /// Waits for exit. `None` means the process was ended by a signal.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    /// Asks ffmpeg to finish the current container and exit by sending `q` on stdin.
    pub async fn interrupt(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.write_all(b"q").await?;
            stdin.flush().await?;
        }
        Ok(())
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    /// Interrupt, then kill if the process has not exited within `grace`.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Err(e) = self.interrupt().await {
            debug!("[{}] interrupt failed, process likely gone: {}", self.label, e);
        }
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!("[{}] did not exit within {:?}, killing", self.label, grace);
                self.kill().await?;
                Ok(None)
            }
        }
    }
}
