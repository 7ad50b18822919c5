//! Server-sent-event subscription to the beacon node's `head` and `block`
//! topics.
//!
//! The reader task pushes decoded events into unbounded channels and posts a
//! single closed signal when the HTTP stream ends for any reason. The owner
//! decides when to reconnect by calling [`BlockStream::start`] again; the
//! channels survive restarts so no event is lost across the gap on the
//! receiver side.

use crate::beacon_client::types::{EventKind, SseBlock, SseError, SseHead};
use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct BlockStream {
    client: reqwest::Client,
    server: String,
    pub head_rx: mpsc::UnboundedReceiver<SseHead>,
    pub block_rx: mpsc::UnboundedReceiver<SseBlock>,
    pub closed_rx: mpsc::UnboundedReceiver<()>,
    head_tx: mpsc::UnboundedSender<SseHead>,
    block_tx: mpsc::UnboundedSender<SseBlock>,
    closed_tx: mpsc::UnboundedSender<()>,
    handle: Option<JoinHandle<()>>,
}

impl BlockStream {
    pub(crate) fn new(client: reqwest::Client, server: String) -> Self {
        let (head_tx, head_rx) = mpsc::unbounded_channel();
        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            client,
            server,
            head_rx,
            block_rx,
            closed_rx,
            head_tx,
            block_tx,
            closed_tx,
            handle: None,
        }
    }

    /// Spawn (or respawn) the reader task. A task left over from a previous
    /// subscription is aborted first.
    pub fn start(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        let client = self.client.clone();
        let url = format!("{}/eth/v1/events?topics=head,block", self.server);
        let head_tx = self.head_tx.clone();
        let block_tx = self.block_tx.clone();
        let closed_tx = self.closed_tx.clone();
        self.handle = Some(tokio::spawn(async move {
            run_stream(client, url, head_tx, block_tx).await;
            let _ = closed_tx.send(());
        }));
    }

    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for BlockStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read the SSE byte stream until it errors or ends, forwarding decoded
/// events. SSE frames are separated by a blank line.
async fn run_stream(
    client: reqwest::Client,
    url: String,
    head_tx: mpsc::UnboundedSender<SseHead>,
    block_tx: mpsc::UnboundedSender<SseBlock>,
) {
    let response = match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!("event stream rejected with status {}", response.status());
            return;
        }
        Err(e) => {
            warn!("event stream connection failed: {}", e);
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("event stream read failed: {}", e);
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = find_frame_end(&buffer) {
            let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
            let frame = &frame[..pos];
            if frame.is_empty() || frame.starts_with(b":") {
                // keep-alive comment
                continue;
            }
            match EventKind::from_sse_bytes(frame) {
                Ok(EventKind::Head(head)) => {
                    if head_tx.send(head).is_err() {
                        return;
                    }
                }
                Ok(EventKind::Block(block)) => {
                    if block_tx.send(block).is_err() {
                        return;
                    }
                }
                Err(SseError::UnknownTopic(topic)) => {
                    debug!("ignoring event stream topic {}", topic);
                }
                Err(e) => {
                    warn!("undecodable event stream frame: {}", e);
                }
            }
        }
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_end_detection() {
        assert_eq!(find_frame_end(b"event: head\ndata: {}"), None);
        assert_eq!(find_frame_end(b"event: head\ndata: {}\n\nevent:"), Some(20));
    }
}
