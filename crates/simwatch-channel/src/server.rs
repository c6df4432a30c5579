//! Supervisor-side (write-only) channel endpoint.
//!
//! A [`ChannelServer`] binds a Unix domain socket at a per-worker path and
//! accepts connections in a background task. At most one peer connection is
//! live at a time; a newer connection replaces the previous one, which is how
//! a restarted worker re-attaches to the same channel.
//!
//! Pushes are fire-and-forget. A push while no peer is connected, or one that
//! fails because the peer exited, is dropped: the endpoint resets itself to
//! "awaiting connection" and the next successful push delivers only the
//! latest value. The optional connect message (the current access token) is
//! written to every peer right after it connects, so a worker that attaches
//! late still receives the credential it needs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{ChannelError, ChannelMessage};

/// Write-only endpoint of one worker's control channel.
///
/// Cheap to clone; all clones share the same socket and connection state.
/// The socket file is removed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct ChannelServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    /// Live peer connection, if any. `None` while awaiting (re)connection.
    conn: tokio::sync::Mutex<Option<UnixStream>>,
    /// Message replayed to every newly connected peer.
    connect_message: Mutex<Option<ChannelMessage>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelServer {
    /// Bind the channel socket and start accepting connections.
    ///
    /// A stale socket file left behind by a previous run is removed first.
    pub fn bind(path: PathBuf) -> Result<Self, ChannelError> {
        if path.exists() {
            warn!("Removing stale channel socket {}", path.display());
            let _ = std::fs::remove_file(&path);
        }

        let listener = UnixListener::bind(&path).map_err(|source| ChannelError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("Channel listening on {}", path.display());

        let inner = Arc::new(Inner {
            path,
            conn: tokio::sync::Mutex::new(None),
            connect_message: Mutex::new(None),
            accept_task: Mutex::new(None),
        });

        let task = tokio::spawn(run_accept_loop(listener, Arc::downgrade(&inner)));
        *inner.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(Self { inner })
    }

    /// Socket path of this channel, as passed to the worker at launch.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Set (or clear) the message written to every peer right after it
    /// connects. The supervisor keeps this at the latest access token.
    pub fn set_connect_message(&self, message: Option<ChannelMessage>) {
        *self
            .inner
            .connect_message
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = message;
    }

    /// Push one message to the connected peer.
    ///
    /// Returns `true` when the line was written. Returns `false` — without
    /// surfacing an error — when no peer is connected or the write failed;
    /// in the latter case the connection is dropped and the endpoint goes
    /// back to awaiting the next connection.
    pub async fn push(&self, message: &ChannelMessage) -> bool {
        let mut conn = self.inner.conn.lock().await;
        let Some(stream) = conn.as_mut() else {
            debug!(
                "Channel {} not connected, dropping {:?}",
                self.inner.path.display(),
                message
            );
            return false;
        };

        match write_line(stream, message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Channel {} write failed ({e}). Did the worker exit? Awaiting reconnect",
                    self.inner.path.display()
                );
                *conn = None;
                false
            }
        }
    }

    /// Whether a peer is currently connected. Pushes made while this is
    /// `false` are lost by design.
    pub async fn is_connected(&self) -> bool {
        self.inner.conn.lock().await.is_some()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            warn!(
                "Failed to remove channel socket {}: {e}",
                self.path.display()
            );
        }
    }
}

async fn write_line(stream: &mut UnixStream, message: &ChannelMessage) -> std::io::Result<()> {
    let mut line = message.encode();
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await
}

/// Accept loop: store each new peer connection, replacing any previous one,
/// and replay the connect message to it. Exits when the owning
/// [`ChannelServer`] is dropped.
async fn run_accept_loop(listener: UnixListener, inner: Weak<Inner>) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _addr)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                debug!("Channel {} peer connected", inner.path.display());

                let connect_message = inner
                    .connect_message
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(message) = connect_message
                    && let Err(e) = write_line(&mut stream, &message).await
                {
                    warn!(
                        "Channel {} connect message failed: {e}",
                        inner.path.display()
                    );
                    continue;
                }

                *inner.conn.lock().await = Some(stream);
            }
            Err(e) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                warn!("Channel {} accept error: {e}", inner.path.display());
                // Brief pause before retrying to avoid a tight error loop
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
