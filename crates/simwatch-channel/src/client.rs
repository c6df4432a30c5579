//! Worker-side (read-only) channel endpoint.
//!
//! A simulation worker connects to the socket path it received as a
//! `Channel=<path>` launch argument and consumes pushed values for the
//! lifetime of the process. A dedicated reader task parses incoming lines
//! and forwards recognized messages over a bounded queue, preserving arrival
//! order; the worker either polls [`ChannelClient::recv`] or hands two
//! handlers to [`ChannelClient::dispatch`] and lets it run until the
//! supervisor closes the channel.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{ChannelError, ChannelMessage};

/// Capacity of the reader→consumer queue. Pushes are tiny and rare; the
/// bound only exists to give the reader backpressure if a worker stalls.
const QUEUE_CAPACITY: usize = 32;

/// Read-only endpoint of a worker's control channel.
pub struct ChannelClient {
    rx: mpsc::Receiver<ChannelMessage>,
    reader_task: JoinHandle<()>,
}

impl ChannelClient {
    /// Connect to the supervisor's channel socket and start the reader task.
    pub async fn connect(path: &Path) -> Result<Self, ChannelError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ChannelError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Connected to channel {}", path.display());

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let path = path.to_path_buf();
        let reader_task = tokio::spawn(async move {
            run_reader(stream, tx).await;
            debug!("Channel {} reached end of stream", path.display());
        });

        Ok(Self { rx, reader_task })
    }

    /// Receive the next pushed message, in arrival order.
    ///
    /// Returns `None` once the supervisor side closed the channel and all
    /// buffered messages have been consumed.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Run the receive loop to completion, dispatching each message to the
    /// matching handler. Keep-alive lines are consumed here; they carry no
    /// payload and exist only so the supervisor's writes observe liveness.
    pub async fn dispatch<T, M>(mut self, mut on_token: T, mut on_month: M)
    where
        T: FnMut(&str),
        M: FnMut(i32),
    {
        while let Some(message) = self.recv().await {
            match message {
                ChannelMessage::Token(token) => on_token(&token),
                ChannelMessage::Month(month) => on_month(month),
                ChannelMessage::KeepAlive => {}
            }
        }
        self.shutdown().await;
    }

    /// Stop the reader task and close the receive side. The reader may be
    /// parked waiting for a line that will never come, so it is aborted
    /// rather than joined.
    pub async fn shutdown(self) {
        drop(self.rx);
        self.reader_task.abort();
        if let Err(e) = self.reader_task.await
            && !e.is_cancelled()
        {
            warn!("Channel reader task panicked: {e}");
        }
    }
}

async fn run_reader(stream: UnixStream, tx: mpsc::Sender<ChannelMessage>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(message) = ChannelMessage::parse(&line) else {
                    debug!("Ignoring unrecognized channel line: {line:?}");
                    continue;
                };
                if tx.send(message).await.is_err() {
                    // Consumer is gone; nothing left to deliver to.
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("Channel read failed: {e}");
                return;
            }
        }
    }
}
