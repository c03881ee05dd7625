//! Accept loop and per-connection frame handling.

use anyhow::Result;
use bytes::BytesMut;
use dbzr_smart::protocol::{HEADER_LEN, decode_frame, decode_header, encode_frame};
use dbzr_smart::{SmartRequest, SmartServerHandler};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Accept connections until `shutdown` completes.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<SmartServerHandler>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!("connection from {}", peer);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        error!("connection from {} failed: {:#}", peer, e);
                    }
                });
            }
        }
    }
}

/// Answer requests on `stream` until the peer hangs up.
pub async fn serve_connection(mut stream: TcpStream, handler: Arc<SmartServerHandler>) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut header = [0u8; HEADER_LEN];
    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let parsed = decode_header(&header)?;
        let mut frame = BytesMut::with_capacity(HEADER_LEN + parsed.payload_len);
        frame.extend_from_slice(&header);
        frame.resize(HEADER_LEN + parsed.payload_len, 0);
        stream.read_exact(&mut frame[HEADER_LEN..]).await?;
        let frame = frame.freeze();

        // Repository work is blocking file IO.
        let handler = Arc::clone(&handler);
        let reply = tokio::task::spawn_blocking(move || -> dbzr_core::Result<Vec<u8>> {
            let request: SmartRequest = decode_frame(&frame)?;
            let response = handler.handle(&request);
            debug!("{} -> {:?}", request.verb_str(), response.status);
            encode_frame(&response)
        })
        .await??;
        stream.write_all(&reply).await?;
    }
}
