//! Sender that streams commands to a destination over TCP
//!
//! Each sender owns one connection. Commands go through a bounded queue to a
//! writer task, so a slow destination pushes back on `enqueue`. Replies are
//! read and discarded by a second task to keep the socket from filling up.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::{Sender, SenderError, SenderResult};

/// Read size used while discarding replies
const REPLY_BUFFER_SIZE: usize = 8 * 1024;

enum Message {
    Command(Bytes),
    Close(oneshot::Sender<std::io::Result<()>>),
}

#[derive(Debug, Default)]
struct Stats {
    commands: AtomicU64,
    bytes: AtomicU64,
    reply_bytes: AtomicU64,
}

/// TCP connection to a destination store
#[derive(Clone, Debug)]
pub struct TcpSender {
    id: usize,
    tx: mpsc::Sender<Message>,
    stats: Arc<Stats>,
}

impl TcpSender {
    /// Connect to `addr` and start the writer and reply-drain tasks
    pub async fn connect(
        id: usize,
        addr: impl ToSocketAddrs + std::fmt::Display,
        queue_depth: usize,
    ) -> SenderResult<Self> {
        let label = addr.to_string();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SenderError::Connect {
                addr: label.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let stats = Arc::new(Stats::default());

        tokio::spawn(write_loop(id, writer, rx, Arc::clone(&stats)));
        tokio::spawn(drain_replies(id, reader, Arc::clone(&stats)));

        info!("Sender {} connected to {}", id, label);
        Ok(Self { id, tx, stats })
    }

    /// Index of this sender among the run's connections
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Commands written to the socket so far
    pub fn commands_written(&self) -> u64 {
        self.stats.commands.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket so far
    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes.load(Ordering::Relaxed)
    }

    /// Reply bytes read back from the destination so far
    pub fn reply_bytes(&self) -> u64 {
        self.stats.reply_bytes.load(Ordering::Relaxed)
    }
}

async fn write_loop(
    id: usize,
    writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    stats: Arc<Stats>,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(message) = rx.recv().await {
        match message {
            Message::Command(command) => {
                if let Err(e) = writer.write_all(&command).await {
                    error!("Sender {} write failed: {}", id, e);
                    return;
                }
                stats.commands.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes
                    .fetch_add(command.len() as u64, Ordering::Relaxed);

                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        error!("Sender {} flush failed: {}", id, e);
                        return;
                    }
                }
            }
            Message::Close(ack) => {
                rx.close();
                let result = async {
                    writer.flush().await?;
                    writer.shutdown().await
                }
                .await;
                debug!(
                    "Sender {} closed after {} commands",
                    id,
                    stats.commands.load(Ordering::Relaxed)
                );
                let _ = ack.send(result);
                return;
            }
        }
    }

    if let Err(e) = writer.flush().await {
        error!("Sender {} final flush failed: {}", id, e);
    }
}

async fn drain_replies(id: usize, mut reader: OwnedReadHalf, stats: Arc<Stats>) {
    let mut buf = vec![0u8; REPLY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(
                    "Sender {} destination closed after {} reply bytes",
                    id,
                    stats.reply_bytes.load(Ordering::Relaxed)
                );
                return;
            }
            Ok(n) => {
                stats.reply_bytes.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Sender {} reply stream ended: {}", id, e);
                return;
            }
        }
    }
}

#[async_trait]
impl Sender for TcpSender {
    async fn enqueue(&self, command: Bytes) -> SenderResult<()> {
        self.tx
            .send(Message::Command(command))
            .await
            .map_err(|_| SenderError::Closed)
    }

    async fn close(&self) -> SenderResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Close(ack_tx)).await.is_err() {
            return Ok(());
        }
        match ack_rx.await {
            Ok(result) => result.map_err(SenderError::from),
            Err(_) => Ok(()),
        }
    }
}
