//! Length-prefixed JSON framing over the h2 bidirectional stream.
//!
//! Each frame is a 4-byte big-endian payload length followed by the JSON
//! rendering of the message. Framing errors are terminal for the stream;
//! an undeserializable payload is dropped by the caller instead.

use anyhow::{anyhow, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::{RecvStream, SendStream};
use serde::Serialize;

pub async fn send_frame<T: Serialize>(
    send_stream: &mut SendStream<Bytes>,
    frame: &T,
) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(frame).context("serialize control frame")?;
    let mut buffer = BytesMut::with_capacity(4 + payload.len());
    buffer.put_u32(payload.len() as u32);
    buffer.extend_from_slice(&payload);
    send_stream
        .send_data(buffer.freeze(), false)
        .context("failed to send control frame")
}

/// Next raw frame payload, or `None` on clean stream close. Received bytes
/// are handed back to flow control so a chatty server cannot stall the
/// window.
pub async fn read_next_payload(
    recv: &mut RecvStream,
    buffer: &mut BytesMut,
) -> anyhow::Result<Option<Bytes>> {
    loop {
        if let Some(payload) = split_payload(buffer)? {
            return Ok(Some(payload));
        }

        match recv.data().await {
            Some(Ok(bytes)) => {
                let _ = recv.flow_control().release_capacity(bytes.len());
                buffer.extend_from_slice(&bytes);
            }
            Some(Err(err)) => return Err(anyhow!(err)),
            None => {
                if buffer.is_empty() {
                    return Ok(None);
                }
                return Err(anyhow!("control stream ended mid-frame"));
            }
        }
    }
}

fn split_payload(buffer: &mut BytesMut) -> anyhow::Result<Option<Bytes>> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if buffer.len() < 4 + len {
        return Ok(None);
    }

    buffer.advance(4);
    Ok(Some(buffer.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anssl_common::{AgentIdentity, NotifyRequest, NotifyResponse};
    use http::{Request, StatusCode};

    fn identity() -> AgentIdentity {
        AgentIdentity {
            access_key: "ak".into(),
            client_id: "cid".into(),
            version: "v0".into(),
        }
    }

    fn framed(payload: &[u8]) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(4 + payload.len());
        buffer.put_u32(payload.len() as u32);
        buffer.extend_from_slice(payload);
        buffer
    }

    #[test]
    fn split_payload_waits_for_full_frame() {
        let mut buffer = BytesMut::from(&[0u8, 0, 0, 5, b'h', b'i'][..]);
        assert!(split_payload(&mut buffer).expect("split").is_none());
        assert_eq!(buffer.len(), 6, "partial frame must stay buffered");
    }

    #[test]
    fn split_payload_leaves_following_bytes() {
        let mut buffer = framed(b"{\"type\":\"UNKNOWN\"}");
        buffer.extend_from_slice(b"extra");

        let payload = split_payload(&mut buffer).expect("split").expect("frame");
        assert_eq!(&payload[..], b"{\"type\":\"UNKNOWN\"}");
        assert_eq!(&buffer[..], b"extra");
    }

    async fn h2_stream_pair() -> (
        SendStream<Bytes>,
        RecvStream,
        tokio::task::JoinHandle<()>,
        tokio::task::JoinHandle<()>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (mut client, client_conn) = h2::client::handshake(client_io).await.expect("client");
        let client_task = tokio::spawn(async move {
            let _ = client_conn.await;
        });

        let mut server = h2::server::handshake(server_io).await.expect("server");
        let (response_fut, send_stream) = client
            .send_request(
                Request::builder()
                    .method("CONNECT")
                    .uri("http://control.example/stream")
                    .body(())
                    .expect("request"),
                false,
            )
            .expect("send request");
        let (request, mut respond) = server.accept().await.expect("accept").expect("stream");
        let response = http::Response::builder()
            .status(StatusCode::OK)
            .body(())
            .expect("response");
        respond.send_response(response, false).expect("respond");
        let server_task = tokio::spawn(async move {
            while let Some(result) = server.accept().await {
                if result.is_err() {
                    break;
                }
            }
        });
        let _ = response_fut.await;

        (send_stream, request.into_body(), client_task, server_task)
    }

    #[tokio::test]
    async fn frame_round_trips_via_h2() {
        let (mut send_stream, mut recv_stream, client_task, server_task) = h2_stream_pair().await;
        let mut buffer = BytesMut::new();

        let frame = NotifyRequest::heartbeat(&identity());
        send_frame(&mut send_stream, &frame).await.expect("send");

        let payload = read_next_payload(&mut recv_stream, &mut buffer)
            .await
            .expect("read")
            .expect("payload");
        let parsed: NotifyRequest = serde_json::from_slice(&payload).expect("decode");
        assert_eq!(parsed.access_key, "ak");
        assert_eq!(parsed.client_id, "cid");

        client_task.abort();
        server_task.abort();
    }

    #[tokio::test]
    async fn multiple_frames_parse_from_one_buffer() {
        let (mut send_stream, mut recv_stream, client_task, server_task) = h2_stream_pair().await;
        let mut buffer = BytesMut::new();

        send_frame(&mut send_stream, &NotifyRequest::heartbeat(&identity()))
            .await
            .expect("send 1");
        send_frame(
            &mut send_stream,
            &NotifyRequest::connect_reply(&identity(), "r1", "aliyun", true),
        )
        .await
        .expect("send 2");
        send_stream.send_data(Bytes::new(), true).expect("close");

        let first = read_next_payload(&mut recv_stream, &mut buffer)
            .await
            .expect("read")
            .expect("payload");
        let first: NotifyRequest = serde_json::from_slice(&first).expect("decode");
        assert!(first.connect_request.is_none());

        let second = read_next_payload(&mut recv_stream, &mut buffer)
            .await
            .expect("read")
            .expect("payload");
        let second: NotifyRequest = serde_json::from_slice(&second).expect("decode");
        assert_eq!(second.request_id, "r1");

        client_task.abort();
        server_task.abort();
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (mut send_stream, mut recv_stream, client_task, server_task) = h2_stream_pair().await;
        send_stream.send_data(Bytes::new(), true).expect("close");

        let mut buffer = BytesMut::new();
        let payload = read_next_payload(&mut recv_stream, &mut buffer)
            .await
            .expect("read");
        assert!(payload.is_none());

        client_task.abort();
        server_task.abort();
    }

    #[tokio::test]
    async fn truncated_frame_is_a_stream_error() {
        let (mut send_stream, mut recv_stream, client_task, server_task) = h2_stream_pair().await;
        send_stream
            .send_data(Bytes::from_static(&[0, 0, 0, 9, b'x']), true)
            .expect("send");

        let mut buffer = BytesMut::new();
        let err = read_next_payload(&mut recv_stream, &mut buffer)
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("ended mid-frame"), "{err}");

        client_task.abort();
        server_task.abort();
    }

    #[tokio::test]
    async fn garbage_payload_is_left_to_the_caller() {
        // Framing succeeds even when the payload is not valid JSON; the
        // receive loop decides to drop it.
        let (mut send_stream, mut recv_stream, client_task, server_task) = h2_stream_pair().await;
        let mut raw = BytesMut::new();
        raw.put_u32(8);
        raw.extend_from_slice(b"not-json");
        send_stream.send_data(raw.freeze(), true).expect("send");

        let mut buffer = BytesMut::new();
        let payload = read_next_payload(&mut recv_stream, &mut buffer)
            .await
            .expect("read")
            .expect("payload");
        assert!(serde_json::from_slice::<NotifyResponse>(&payload).is_err());

        client_task.abort();
        server_task.abort();
    }
}
