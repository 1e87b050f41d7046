//! Control socket between the CLI and a running scheduler.
//!
//! Frames are a big-endian `u32` length followed by a JSON document. A
//! connection carries any number of request/response pairs.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use taskq_core::TaskId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::config::DrainPolicy;
use crate::scheduler::{CancelOutcome, SchedulerError, SchedulerHandle, SchedulerStatus};

/// Maximum frame size (1 MB).
const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("a scheduler is already running on {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("control socket I/O: {0}")]
    Io(#[from] io::Error),

    #[error("malformed control message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("scheduler error: {0}")]
    Remote(String),

    #[error("unexpected response to {0} request")]
    UnexpectedResponse(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Cancel { task_id: TaskId },
    Stop { drain: DrainPolicy },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Cancelled { outcome: CancelOutcome },
    Stopping,
    Status { status: SchedulerStatus },
    NotFound { task_id: TaskId },
    Error { message: String },
}

/// Read a length-delimited frame from an async reader.
///
/// Returns `None` on a clean EOF before the length prefix.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    reader.read_exact(&mut buf).await?;

    Ok(Some(buf.freeze()))
}

/// Write a length-delimited frame to an async writer.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes", data.len()),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}

async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<(), ControlError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    write_frame(writer, &data).await?;
    Ok(())
}

// =============================================================================
// Server
// =============================================================================

/// Listening side of the control socket, owned by the scheduler process.
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket.
    ///
    /// A socket that still accepts connections means another scheduler owns
    /// this data directory. A stale socket file is removed.
    pub async fn bind(path: impl Into<PathBuf>) -> Result<Self, ControlError> {
        let path = path.into();

        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(ControlError::AlreadyRunning(path));
            }
            tracing::debug!(socket = %path.display(), "Removing stale control socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::info!(socket = %path.display(), "Control socket listening");
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the task is aborted.
    pub async fn serve(self, scheduler: SchedulerHandle) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, scheduler).await {
                            tracing::debug!(error = %e, "Control connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Control socket accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    scheduler: SchedulerHandle,
) -> Result<(), ControlError> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let response = match serde_json::from_slice::<ControlRequest>(&frame) {
            Ok(request) => {
                tracing::debug!(?request, "Control request");
                dispatch(&scheduler, request).await
            }
            Err(e) => ControlResponse::Error {
                message: format!("bad request: {e}"),
            },
        };
        send_message(&mut stream, &response).await?;
    }
    Ok(())
}

async fn dispatch(scheduler: &SchedulerHandle, request: ControlRequest) -> ControlResponse {
    let result = match request {
        ControlRequest::Cancel { task_id } => scheduler
            .request_cancel(task_id)
            .await
            .map(|outcome| ControlResponse::Cancelled { outcome }),
        ControlRequest::Stop { drain } => scheduler
            .stop(drain)
            .await
            .map(|()| ControlResponse::Stopping),
        ControlRequest::Status => scheduler
            .status()
            .await
            .map(|status| ControlResponse::Status { status }),
    };

    match result {
        Ok(response) => response,
        Err(SchedulerError::NotFound(task_id)) => ControlResponse::NotFound { task_id },
        Err(e) => ControlResponse::Error {
            message: e.to_string(),
        },
    }
}

// =============================================================================
// Client
// =============================================================================

/// Connection to a running scheduler's control socket.
#[derive(Debug)]
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    /// Connect to the socket at `path`.
    ///
    /// A missing socket or a refused connection means no scheduler is
    /// running and maps to [`SchedulerError::Unavailable`].
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        match UnixStream::connect(path.as_ref()).await {
            Ok(stream) => Ok(Self { stream }),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(SchedulerError::Unavailable)
            }
            Err(e) => Err(ControlError::Io(e).into()),
        }
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &ControlRequest) -> Result<ControlResponse, ControlError> {
        send_message(&mut self.stream, request).await?;
        let frame = read_frame(&mut self.stream).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "scheduler closed the connection")
        })?;
        Ok(serde_json::from_slice(&frame)?)
    }

    pub async fn cancel(&mut self, task_id: TaskId) -> Result<CancelOutcome, SchedulerError> {
        match self.call(&ControlRequest::Cancel { task_id }).await? {
            ControlResponse::Cancelled { outcome } => Ok(outcome),
            ControlResponse::NotFound { task_id } => Err(SchedulerError::NotFound(task_id)),
            ControlResponse::Error { message } => Err(ControlError::Remote(message).into()),
            _ => Err(ControlError::UnexpectedResponse("cancel").into()),
        }
    }

    pub async fn stop(&mut self, drain: DrainPolicy) -> Result<(), SchedulerError> {
        match self.call(&ControlRequest::Stop { drain }).await? {
            ControlResponse::Stopping => Ok(()),
            ControlResponse::Error { message } => Err(ControlError::Remote(message).into()),
            _ => Err(ControlError::UnexpectedResponse("stop").into()),
        }
    }

    pub async fn status(&mut self) -> Result<SchedulerStatus, SchedulerError> {
        match self.call(&ControlRequest::Status).await? {
            ControlResponse::Status { status } => Ok(status),
            ControlResponse::Error { message } => Err(ControlError::Remote(message).into()),
            _ => Err(ControlError::UnexpectedResponse("status").into()),
        }
    }
}
