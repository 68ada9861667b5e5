//! WebSocket upgrades
//!
//! The kernel does not speak the WebSocket protocol itself: it completes the
//! handshake and then pumps raw bytes between the client connection and the
//! app, which does its own framing.

use crate::http::{app_path, RequestMeta};
use crate::proxy::Proxy;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use grainhost_backend::{ByteStream, WebSocketSession};
use grainhost_core::{GrainhostError, Result};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

const READ_BUFFER_BYTES: usize = 16 * 1024;

/// Whether a request asks to switch to the WebSocket protocol
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        headers.get_all(name).iter().any(|value| {
            value
                .to_str()
                .is_ok_and(|value| value.split(',').any(|item| item.trim().eq_ignore_ascii_case(token)))
        })
    };
    has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

/// Sub-protocols the client offered, in preference order
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_string)
        .collect()
}

/// App-to-client bytes, buffered until the 101 response is on the wire
struct ClientSink {
    sender: mpsc::UnboundedSender<Option<Bytes>>,
}

#[async_trait]
impl ByteStream for ClientSink {
    async fn write(&self, data: Bytes) -> Result<()> {
        self.sender
            .send(Some(data))
            .map_err(|_| GrainhostError::gone("websocket closed"))
    }

    async fn done(&self) -> Result<()> {
        // The socket may already be gone; there is nothing left to finish.
        let _ = self.sender.send(None);
        Ok(())
    }
}

/// Complete a WebSocket handshake on `proxy` and start pumping bytes
pub async fn upgrade(proxy: &Arc<Proxy>, mut request: Request, peer: Option<SocketAddr>) -> Result<Response> {
    let headers = request.headers().clone();
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or_else(|| GrainhostError::invalid("missing Sec-WebSocket-Key"))?;
    let accept = derive_accept_key(key.as_bytes());
    let protocols = requested_protocols(&headers);
    let meta = RequestMeta::new(&headers, request.uri(), peer);
    let path = app_path(request.uri());

    let context = proxy.make_context(&headers)?;

    let on_upgrade = hyper::upgrade::on(&mut request);
    let (sender, outbound) = mpsc::unbounded_channel();
    let opened: WebSocketSession = proxy
        .with_retry(&meta, |session| {
            let context = context.clone();
            let protocols = protocols.clone();
            let client_stream: Box<dyn ByteStream> = Box::new(ClientSink {
                sender: sender.clone(),
            });
            let path = path.as_str();
            async move { session.open_websocket(path, context, protocols, client_stream).await }
        })
        .await?;
    drop(sender);

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept);
    if !opened.protocols.is_empty() {
        let accepted = HeaderValue::from_str(&opened.protocols.join(", "))
            .map_err(|err| GrainhostError::internal(format!("bad protocol from app: {err}")))?;
        response = response.header(header::SEC_WEBSOCKET_PROTOCOL, accepted);
    }
    let response = response
        .body(Body::empty())
        .map_err(|err| GrainhostError::internal(format!("failed to build response: {err}")))?;

    let grain_id = proxy.grain_id().clone();
    let server_stream = opened.server_stream;
    let task = tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let (reader, writer) = tokio::io::split(TokioIo::new(upgraded));
                tokio::select! {
                    result = pump_inbound(reader, server_stream.as_ref()) => {
                        if let Err(err) = result {
                            tracing::debug!(grain_id = %grain_id, error = %err, "websocket inbound ended");
                        }
                    }
                    result = pump_outbound(outbound, writer) => {
                        if let Err(err) = result {
                            tracing::debug!(grain_id = %grain_id, error = %err, "websocket outbound ended");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(grain_id = %grain_id, error = %err, "websocket upgrade failed");
                let _ = server_stream.done().await;
            }
        }
    });
    proxy.register_socket(task);
    Ok(response)
}

/// Client bytes to the app until the client hangs up
async fn pump_inbound<R>(mut reader: R, server_stream: &dyn ByteStream) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            return server_stream.done().await;
        }
        server_stream.write(Bytes::copy_from_slice(&buffer[..read])).await?;
    }
}

/// App bytes to the client until the app finishes
async fn pump_outbound<W>(mut outbound: mpsc::UnboundedReceiver<Option<Bytes>>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(Some(chunk)) = outbound.recv().await {
        writer.write_all(&chunk).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_upgrade_request(&headers));

        headers.remove(header::UPGRADE);
        assert!(!is_upgrade_request(&headers));
    }

    #[test]
    fn test_requested_protocols() {
        let mut headers = HeaderMap::new();
        headers.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat, superchat"));
        headers.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("v2"));
        assert_eq!(requested_protocols(&headers), vec!["chat", "superchat", "v2"]);
    }

    #[test]
    fn test_accept_key() {
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn test_client_sink_queues_until_read() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let sink = ClientSink { sender };
        sink.write(Bytes::from_static(b"hello")).await.unwrap();
        sink.done().await.unwrap();
        assert_eq!(receiver.recv().await, Some(Some(Bytes::from_static(b"hello"))));
        assert_eq!(receiver.recv().await, Some(None));
    }
}
