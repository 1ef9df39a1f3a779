use crate::router;
use crate::service::SessionService;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use session_core::ipc::{SessionRequest, SessionResponse};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Frames are a 4-byte little-endian length followed by a MessagePack body.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

pub async fn run_unix_server(
    socket_path: &str,
    service: Arc<SessionService>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(socket = socket_path, "IPC server listening");

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                tokio::spawn(serve_connection(stream, service.clone()));
            }
            _ = shutdown.recv() => {
                tracing::info!("shutting down IPC server");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

async fn serve_connection(stream: UnixStream, service: Arc<SessionService>) {
    let (read, write) = stream.into_split();
    let mut framed_read = FramedRead::new(read, frame_codec());
    let mut framed_write = FramedWrite::new(write, frame_codec());

    while let Some(frame) = framed_read.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "frame error");
                break;
            }
        };

        let response = match rmp_serde::from_slice::<SessionRequest>(&bytes) {
            Ok(request) => router::handle_request(request, &service).await,
            Err(e) => SessionResponse::err(format!("Deserialization error: {e}")),
        };

        let encoded = match rmp_serde::to_vec_named(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                break;
            }
        };
        if let Err(e) = framed_write.send(Bytes::from(encoded)).await {
            tracing::error!(error = %e, "failed to send response");
            break;
        }
    }
}
