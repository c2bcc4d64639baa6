//! WebSocket framing
//!
//! Inbound text frames carry one JSON request each. Outbound replies are
//! JSON, zlib-compressed and base64-encoded into text frames.

use std::io::Write;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ChannelError;
use crate::server::channel::ChannelEndpoint;
use crate::server::protocol::{Reply, Request};

const PREVIEW_CHARS: usize = 80;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Log-friendly prefix of a payload
pub(crate) fn preview(payload: &str) -> String {
    let mut chars = payload.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// JSON, then zlib, then base64
pub fn encode_reply(reply: &Reply) -> Result<String, std::io::Error> {
    let json = serde_json::to_vec(reply)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Serve one WebSocket connection until either side hangs up or the channel is kicked.
pub async fn serve(stream: TcpStream, peer: String, mut endpoint: ChannelEndpoint) {
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream));
    let ws = tokio::select! {
        biased;
        _ = endpoint.kick.requested() => {
            tracing::debug!("[{}] Kicked during handshake", peer);
            return;
        }
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                tracing::warn!("[{}] WebSocket handshake failed: {}", peer, e);
                return;
            }
            Err(_) => {
                tracing::warn!("[{}] WebSocket handshake timed out", peer);
                return;
            }
        },
    };
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            _ = endpoint.kick.requested() => {
                tracing::debug!("[{}] Kicked", peer);
                let pending = endpoint.drain_replies();
                let flush = async {
                    for reply in pending {
                        let Ok(frame) = encode_reply(&reply) else { continue };
                        if sink.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                };
                if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
                    tracing::debug!("[{}] Gave up flushing replies", peer);
                }
                break;
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    tracing::info!("[{}] [RECV] {}", peer, preview(&text));
                    match Request::decode(&text) {
                        Ok(request) => {
                            if !endpoint.requests.deliver(request).await {
                                break;
                            }
                        }
                        Err(ChannelError::Malformed(reason)) => {
                            tracing::warn!("[{}] Malformed request: {}", peer, reason);
                            endpoint.requests.reject(reason).await;
                            break;
                        }
                        Err(ChannelError::Closed) => break,
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!("[{}] Binary frames are not supported", peer);
                    endpoint.requests.reject("binary frame").await;
                    break;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("[{}] Connection error: {}", peer, e);
                    break;
                }
            },
            reply = endpoint.replies.recv() => {
                let Some(reply) = reply else { break };
                let frame = match encode_reply(&reply) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("[{}] Could not encode '{}' reply: {}", peer, reply.command, e);
                        continue;
                    }
                };
                tracing::info!("[{}] [SEND] {}", peer, preview(&reply.data.to_string()));

                tokio::select! {
                    biased;
                    _ = endpoint.kick.requested() => break,
                    sent = sink.send(Message::Text(frame)) => {
                        if let Err(e) = sent {
                            tracing::debug!("[{}] Send failed: {}", peer, e);
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::info!("[{}] Client disconnected", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::server::channel::{ClientChannel, QueueChannel};
    use tokio_tungstenite::connect_async;

    fn decode_frame(frame: &str) -> Reply {
        let compressed = STANDARD.decode(frame).unwrap();
        let mut json = String::new();
        ZlibDecoder::new(compressed.as_slice())
            .read_to_string(&mut json)
            .unwrap();
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_encoded_reply_decodes() {
        let reply = Reply::new("meta", serde_json::json!({"total": 3, "tags": ["a"]}));
        let frame = encode_reply(&reply).unwrap();
        assert!(!frame.contains('{'));
        assert_eq!(decode_frame(&frame), reply);
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(100);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(80)));
    }

    async fn serve_one() -> (u16, Arc<QueueChannel>, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (channel, endpoint) = QueueChannel::pair("ws-test", 4);
        let task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve(stream, peer.to_string(), endpoint).await;
        });
        (port, Arc::new(channel), task)
    }

    #[tokio::test]
    async fn test_request_and_compressed_reply() {
        let (port, channel, task) = serve_one().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}", port)).await.unwrap();

        ws.send(Message::Text(r#"{"command":"view","start":1,"end":2}"#.into()))
            .await
            .unwrap();
        let request = channel.receive().await.unwrap();
        assert_eq!(request.command, "view");
        assert_eq!(request.params["end"], 2);

        channel
            .send(Reply::new("view", serde_json::json!({"record": 1})))
            .await
            .unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        assert_eq!(decode_frame(&text).data["record"], 1);

        tokio::time::timeout(Duration::from_secs(1), channel.close())
            .await
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_terminal() {
        let (port, channel, task) = serve_one().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}", port)).await.unwrap();

        ws.send(Message::Text("{not json".into())).await.unwrap();
        assert!(matches!(
            channel.receive().await,
            Err(ChannelError::Malformed(_))
        ));
        task.await.unwrap();
        assert_eq!(channel.receive().await, Err(ChannelError::Closed));
    }
}
