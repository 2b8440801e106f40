//! Ingestion worker as a child process
//!
//! The child writes tickets to its stdout and stops once its stdin is
//! closed. The parent forwards the stdout stream into the scheduler channel.

use fairq_core::{FairqError, FairqResult, JobTicket};
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::forward_tickets;

/// Handle to a running ingestion child process
pub struct IngestProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    forwarder: JoinHandle<FairqResult<usize>>,
}

impl IngestProcess {
    /// Spawn `program args...` and forward its ticket stream into `tx`
    pub fn spawn(
        program: &Path,
        args: Vec<OsString>,
        tx: mpsc::UnboundedSender<JobTicket>,
    ) -> FairqResult<Self> {
        let mut cmd = Command::new(program);
        cmd.args(&args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!(program = %program.display(), error = %e, "Failed to spawn ingest process");
            FairqError::Internal(format!("failed to spawn ingest process: {}", e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FairqError::Internal("ingest process has no stdout".to_string()))?;
        let stdin = child.stdin.take();

        let forwarder = tokio::spawn(forward_tickets(BufReader::new(stdout), tx));
        info!(pid = child.id().unwrap_or(0), "Ingest process started");

        Ok(Self {
            child,
            stdin,
            forwarder,
        })
    }

    /// Close the child's stdin and wait for it to exit
    ///
    /// The child is killed when it does not exit within `grace`.
    pub async fn stop(mut self, grace: Duration) -> FairqResult<()> {
        drop(self.stdin.take());

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(status = %status, "Ingest process exited");
            }
            Err(_) => {
                warn!("Ingest process did not stop in time, killing it");
                self.child.kill().await?;
            }
        }

        match self.forwarder.await {
            Ok(Ok(forwarded)) => debug!(forwarded = forwarded, "Ticket stream closed"),
            Ok(Err(e)) => warn!(error = %e, "Ticket stream failed"),
            Err(e) => warn!(error = %e, "Ticket forwarder panicked"),
        }
        Ok(())
    }
}

/// Termination flag for the child side, set once stdin reaches EOF
pub fn stop_on_stdin_close() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        debug!("Stdin closed, stopping ingestion");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use fairq_core::JobConfig;

    #[tokio::test]
    async fn test_child_stream_is_forwarded() {
        let ticket = JobTicket::new(JobConfig::new("train-net", "ilja"), "sha256:a");
        let line = crate::codec::encode(&ticket).unwrap();

        // Print one ticket, then block until stdin closes
        let script = format!("printf '%s\\n' '{}'; cat > /dev/null", line.trim_end());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = IngestProcess::spawn(
            Path::new("sh"),
            vec!["-c".into(), script.into()],
            tx,
        )
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(ticket));

        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
