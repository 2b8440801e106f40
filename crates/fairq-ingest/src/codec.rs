//! Ticket stream codec
//!
//! Tickets cross the process boundary as one JSON document per line.

use async_trait::async_trait;
use fairq_core::{FairqError, FairqResult, JobTicket};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Destination of the tickets emitted by the pipeline
#[async_trait]
pub trait TicketSink: Send {
    async fn send(&mut self, ticket: JobTicket) -> FairqResult<()>;

    /// Signal that no more tickets follow
    async fn close(&mut self) -> FairqResult<()>;
}

#[async_trait]
impl TicketSink for mpsc::UnboundedSender<JobTicket> {
    async fn send(&mut self, ticket: JobTicket) -> FairqResult<()> {
        mpsc::UnboundedSender::send(self, ticket)
            .map_err(|_| FairqError::Internal("ticket receiver dropped".to_string()))
    }

    async fn close(&mut self) -> FairqResult<()> {
        // The receiver sees the channel closed once every sender is dropped
        Ok(())
    }
}

/// Writes tickets as JSON lines
pub struct TicketWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> TicketWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TicketSink for TicketWriter<W> {
    async fn send(&mut self, ticket: JobTicket) -> FairqResult<()> {
        let line = encode(&ticket)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> FairqResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

pub fn encode(ticket: &JobTicket) -> FairqResult<String> {
    let mut line = serde_json::to_string(ticket)?;
    line.push('\n');
    Ok(line)
}

pub fn decode(line: &str) -> FairqResult<JobTicket> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Forward a ticket stream into the scheduler's channel until EOF
///
/// Malformed lines are logged and skipped. Returns the number of forwarded
/// tickets.
pub async fn forward_tickets<R>(reader: R, tx: mpsc::UnboundedSender<JobTicket>) -> FairqResult<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let ticket = match decode(&line) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(error = %e, "Skipping malformed ticket line");
                continue;
            }
        };

        debug!(job_id = %ticket.id, name = %ticket.config.name, "Forwarding ticket");
        if tx.send(ticket).is_err() {
            warn!("Scheduler channel closed, dropping ticket stream");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairq_core::JobConfig;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_writer_output_feeds_forwarder() {
        let first = JobTicket::new(JobConfig::new("train-net", "ilja"), "sha256:a");
        let second = JobTicket::new(JobConfig::new("eval-net", "markus"), "sha256:b");

        let mut writer = TicketWriter::new(Vec::new());
        writer.send(first.clone()).await.unwrap();
        writer.send(second.clone()).await.unwrap();
        let mut bytes = writer.into_inner();
        bytes.extend_from_slice(b"garbage\n\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let count = forward_tickets(BufReader::new(bytes.as_slice()), tx)
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(rx.recv().await.unwrap(), second);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_encode_is_single_line() {
        let mut config = JobConfig::new("train-net", "ilja");
        config
            .run_params
            .insert("command".to_string(), serde_json::json!(["a\nb"]));
        let line = encode(&JobTicket::new(config, "img")).unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (mut tx, mut rx) = mpsc::unbounded_channel();
        let ticket = JobTicket::new(JobConfig::new("train-net", "ilja"), "img");
        TicketSink::send(&mut tx, ticket.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ticket);

        drop(rx);
        assert!(TicketSink::send(&mut tx, ticket).await.is_err());
    }
}
