use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use fishler_common::helpers::fs::{create_secure_directory, secure_file};
use fishler_common::{FishlerConfig, SessionId};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::*;

#[derive(thiserror::Error, Debug)]
pub enum TranscriptError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("writer is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TranscriptError>;

/// Per-session append-only transcript files under `<log-basepath>/session/`.
pub struct SessionTranscripts {
    path: PathBuf,
}

impl SessionTranscripts {
    pub fn new(config: &FishlerConfig) -> Result<Self> {
        let path = config.session_log_dir();
        create_secure_directory(&path)?;
        Ok(Self { path })
    }

    pub async fn start(&self, id: &SessionId) -> Result<TranscriptWriter> {
        let path = self.path_for(id);
        info!(session=%id, path=?path, "recording session");
        TranscriptWriter::new(path).await
    }

    pub fn path_for(&self, id: &SessionId) -> PathBuf {
        self.path.join(format!("{id}.log"))
    }
}

/// Hands bytes to a background writer task so recording never blocks the
/// session I/O path. `finalize` drains everything queued before returning.
pub struct TranscriptWriter {
    sender: mpsc::Sender<Bytes>,
    done: oneshot::Receiver<()>,
}

impl TranscriptWriter {
    async fn new(path: PathBuf) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        secure_file(&path)?;

        let mut writer = BufWriter::new(file);
        let (sender, mut receiver) = mpsc::channel::<Bytes>(1024);
        let (done_tx, done) = oneshot::channel();
        tokio::spawn(async move {
            if let Err(error) = async {
                while let Some(bytes) = receiver.recv().await {
                    writer.write_all(&bytes).await?;
                }
                writer.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await
            {
                error!(%error, ?path, "failed to write transcript");
            }
            let _ = done_tx.send(());
        });

        Ok(TranscriptWriter { sender, done })
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.sender
            .send(BytesMut::from(data).freeze())
            .await
            .map_err(|_| TranscriptError::Closed)
    }

    /// Closes the transcript. Call only after all producing tasks have
    /// drained; returns once the file is flushed.
    pub async fn finalize(self) {
        drop(self.sender);
        let _ = self.done.await;
    }
}
