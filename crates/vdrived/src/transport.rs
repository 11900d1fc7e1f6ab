//! Emulated transports: the BLE module UART and the USB bulk endpoint pair,
//! each carried over a Unix socket.
//!
//! The UART socket speaks raw EDM frames. The bulk socket speaks
//! `u32-le length ‖ payload` records, one per OUT transfer; IN transfers
//! come back the same way.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vdrive_proto::{edm, fragment, PacketParser, Reassembler};
use vdrive_session::Handler;
use vdrive_ums::UmsHandler;

async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let _ = tokio::fs::remove_file(path).await;

    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

/// Serve the BLE data channel.
pub async fn serve_uart(path: &Path, handler: Arc<Mutex<Handler>>) -> Result<()> {
    let listener = bind(path).await?;
    info!(socket = %path.display(), "BLE UART: listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = uart_connection(stream, handler).await {
                debug!("BLE connection closed: {e}");
            }
        });
    }
}

async fn uart_connection(mut stream: UnixStream, handler: Arc<Mutex<Handler>>) -> Result<()> {
    let mut parser = PacketParser::new();
    let mut reassembler = Reassembler::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;

        if n == 0 {
            return Ok(());
        }

        for payload in parser.push(&buf[..n]) {
            let Some((channel, frag)) = edm::data_event(&payload) else {
                continue;
            };

            let Some(envelope) = reassembler.feed(frag) else {
                continue;
            };

            let response = handler.lock().await.handle_envelope(&envelope).await;

            if response.is_empty() {
                continue;
            }

            for frag in fragment::split(&response)? {
                let packet = edm::data_command(channel, &frag)?;
                stream.write_all(&packet).await?;
            }
        }
    }
}

/// Serve the USB bulk endpoint pair.
pub async fn serve_bulk(path: &Path, ums: Arc<Mutex<UmsHandler>>) -> Result<()> {
    let listener = bind(path).await?;
    info!(socket = %path.display(), "USB bulk: listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let ums = ums.clone();

        tokio::spawn(async move {
            if let Err(e) = bulk_connection(stream, ums).await {
                debug!("bulk connection closed: {e}");
            }
        });
    }
}

async fn bulk_connection(mut stream: UnixStream, ums: Arc<Mutex<UmsHandler>>) -> Result<()> {
    loop {
        let len = match stream.read_u32_le().await {
            Ok(len) => len as usize,
            Err(_) => return Ok(()),
        };

        if len > 64 * 1024 * 1024 {
            warn!(len, "oversized bulk transfer, dropping connection");
            return Ok(());
        }

        let mut transfer = vec![0u8; len];
        stream.read_exact(&mut transfer).await?;

        let replies = ums.lock().await.handle_out(&transfer).await;

        for reply in replies {
            stream.write_u32_le(reply.len() as u32).await?;
            stream.write_all(&reply).await?;
        }
    }
}
