//! Peer links.
//!
//! A [`PeerLink`] is one end of a bidirectional message pipe. Sessions only
//! ever see the two channels; whether the far end is another task in this
//! process or a socket is decided when the link is built.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::message::SyncMessage;

const LINK_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct PeerLink {
    label: String,
    outbound: mpsc::Sender<SyncMessage>,
    inbound: mpsc::Receiver<SyncMessage>,
}

impl PeerLink {
    /// Two connected in-process ends.
    pub fn pair() -> (PeerLink, PeerLink) {
        let (a_tx, a_rx) = mpsc::channel(LINK_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(LINK_CAPACITY);
        (
            PeerLink {
                label: "memory:a".to_string(),
                outbound: a_tx,
                inbound: b_rx,
            },
            PeerLink {
                label: "memory:b".to_string(),
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    /// Speak newline-delimited JSON over `stream`.
    ///
    /// Spawns a reader task and a writer task. Lines that do not parse are
    /// logged and skipped; a read or write error closes the link.
    pub fn over_stream<S>(stream: S, label: impl Into<String>) -> PeerLink
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let (reader, mut writer) = tokio::io::split(stream);
        let (inbound_tx, inbound) = mpsc::channel::<SyncMessage>(LINK_CAPACITY);
        let (outbound, mut outbound_rx) = mpsc::channel::<SyncMessage>(LINK_CAPACITY);

        {
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<SyncMessage>(&line) {
                                Ok(message) => {
                                    if inbound_tx.send(message).await.is_err() {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(peer = %label, error = %err, "skipping invalid sync message");
                                }
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(peer = %label, "peer closed stream");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(peer = %label, error = %err, "sync stream read failed");
                            break;
                        }
                    }
                }
            });
        }

        {
            let label = label.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let mut line = match serde_json::to_string(&message) {
                        Ok(line) => line,
                        Err(err) => {
                            tracing::error!(peer = %label, error = %err, "cannot encode sync message");
                            continue;
                        }
                    };
                    line.push('\n');
                    if let Err(err) = writer.write_all(line.as_bytes()).await {
                        tracing::warn!(peer = %label, error = %err, "sync stream write failed");
                        break;
                    }
                    if let Err(err) = writer.flush().await {
                        tracing::warn!(peer = %label, error = %err, "sync stream flush failed");
                        break;
                    }
                }
                let _ = writer.shutdown().await;
            });
        }

        PeerLink {
            label,
            outbound,
            inbound,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&self, message: SyncMessage) -> Result<(), SyncError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SyncError::Transport(format!("link {} closed", self.label)))
    }

    /// Next message from the peer; `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.inbound.recv().await
    }

    pub(crate) fn into_parts(self) -> (String, mpsc::Sender<SyncMessage>, mpsc::Receiver<SyncMessage>) {
        (self.label, self.outbound, self.inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::SourceId;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (a, mut b) = PeerLink::pair();
        a.send(SyncMessage::CaughtUp).await.unwrap();
        assert_eq!(b.recv().await, Some(SyncMessage::CaughtUp));
        drop(a);
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn stream_link_writes_one_json_line_per_message() {
        let (near, mut far) = tokio::io::duplex(4096);
        let link = PeerLink::over_stream(near, "duplex");
        link.send(SyncMessage::Ack {
            origin: SourceId::from("s1"),
            seq: 3,
        })
        .await
        .unwrap();
        drop(link);

        let mut raw = String::new();
        far.read_to_string(&mut raw).await.unwrap();
        assert_eq!(raw, "{\"type\":\"ack\",\"origin\":\"s1\",\"seq\":3}\n");
    }

    #[tokio::test]
    async fn stream_link_skips_garbage_lines() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut link = PeerLink::over_stream(near, "duplex");
        far.write_all(b"not json\n\n{\"type\":\"caught_up\"}\n").await.unwrap();
        assert_eq!(link.recv().await, Some(SyncMessage::CaughtUp));
        drop(far);
        assert_eq!(link.recv().await, None);
    }

    #[tokio::test]
    async fn stream_link_skips_messages_with_invalid_source_ids() {
        let (near, mut far) = tokio::io::duplex(4096);
        let mut link = PeerLink::over_stream(near, "duplex");
        far.write_all(b"{\"type\":\"hello\",\"source\":\"../x\",\"name\":\"evil\"}\n{\"type\":\"bye\"}\n")
            .await
            .unwrap();
        assert_eq!(link.recv().await, Some(SyncMessage::Bye));
    }
}
