//! WS framing state machine.
//!
//! # Responsibilities
//! - Wrap each payload in a codec-encoded `{headers, payload}` envelope
//! - Enforce the mask policy (client frames masked, remote frames not)
//! - Reassemble fragmented messages and answer control frames
//! - Close with 1002 on violations and 1009 on oversized messages
//!
//! # Data Flow
//! ```text
//! bytes → buffer → parse_header → wait for full frame → unmask
//!     data frame    → fragment buffer → FIN → decode envelope → Chunk
//!     close         → echo close, report Closure::Peer
//!     ping (remote) → unmasked empty pong
//!     pong (client) → keepalive = true
//! ```

pub mod frame;
pub mod handshake;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::{Blob, Codec, HeaderMap, Serializable, Value};
use crate::protocol::{Chunk, CloseStatus, Closure, Protocol, Received, Role};

use frame::{
    apply_mask, encode_frame, parse_header, FrameHeader, OP_BINARY, OP_CLOSE, OP_CONTINUATION,
    OP_PING, OP_PONG, OP_TEXT,
};

/// Default message cap.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// In-progress fragmented message.
#[derive(Debug)]
struct Fragments {
    opcode: u8,
    data: Vec<u8>,
}

pub struct WsProtocol {
    role: Role,
    codec: Arc<dyn Codec>,
    max_message_bytes: usize,
    buffer: Vec<u8>,
    fragments: Option<Fragments>,
    closed: bool,
}

impl WsProtocol {
    pub fn new(role: Role, codec: Arc<dyn Codec>) -> Self {
        Self::with_limit(role, codec, DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(role: Role, codec: Arc<dyn Codec>, max_message_bytes: usize) -> Self {
        Self {
            role,
            codec,
            max_message_bytes,
            buffer: Vec::new(),
            fragments: None,
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Mask key for outgoing frames; only the client role masks.
    fn outgoing_mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(fastrand::u32(..).to_be_bytes()),
            Role::Remote => None,
        }
    }

    /// Client keepalive probe: a masked, empty ping.
    pub fn ping(&mut self) -> Option<Vec<u8>> {
        if self.closed || self.role != Role::Client {
            return None;
        }
        Some(encode_frame(true, OP_PING, &[], self.outgoing_mask()))
    }

    fn close_frame(&self, status: CloseStatus) -> Vec<u8> {
        encode_frame(true, OP_CLOSE, &status.code().to_be_bytes(), self.outgoing_mask())
    }

    /// Answer a violation: queue the close frame and stop parsing.
    fn fail(&mut self, received: &mut Received, status: CloseStatus) {
        tracing::debug!(role = %self.role, status = %status, "Closing on protocol violation");
        received.replies.push(self.close_frame(status));
        received.close = Some(Closure::Violation(status));
        self.closed = true;
        self.buffer.clear();
        self.fragments = None;
    }

    fn wrap(&self, payload: &[u8], headers: &HeaderMap) -> Option<Vec<u8>> {
        let mut envelope = BTreeMap::new();
        envelope.insert("headers".to_string(), Value::Map(headers.clone()));
        envelope.insert("payload".to_string(), Blob(payload.to_vec()).to_value());
        self.codec.encode(&Value::Map(envelope))
    }

    fn unwrap_envelope(&self, message: &[u8]) -> Chunk {
        let Some(Value::Map(mut envelope)) = self.codec.decode(message) else {
            tracing::debug!(codec = self.codec.name(), "Undecodable envelope");
            return Chunk::default();
        };
        let headers = match envelope.remove("headers") {
            Some(Value::Map(headers)) => headers,
            _ => HeaderMap::new(),
        };
        let payload = envelope
            .get("payload")
            .and_then(Value::as_tagged)
            .and_then(Blob::from_tagged)
            .map(|blob| blob.0)
            .unwrap_or_default();
        Chunk { payload, headers }
    }

    /// Handle one complete frame. Returns false when parsing must stop.
    fn handle_frame(&mut self, header: FrameHeader, payload: Vec<u8>, received: &mut Received) -> bool {
        match header.opcode {
            OP_CLOSE => {
                let status = if payload.len() >= 2 {
                    CloseStatus(u16::from_be_bytes([payload[0], payload[1]]))
                } else {
                    CloseStatus::NORMAL
                };
                received.replies.push(self.close_frame(CloseStatus::NORMAL));
                received.close = Some(Closure::Peer(status));
                self.closed = true;
                self.buffer.clear();
                false
            }
            OP_PING => {
                if self.role == Role::Remote {
                    received.replies.push(encode_frame(true, OP_PONG, &[], None));
                }
                true
            }
            OP_PONG => {
                if self.role == Role::Client {
                    received.keepalive = true;
                }
                true
            }
            OP_TEXT | OP_BINARY => {
                if self.fragments.is_some() {
                    self.fail(received, CloseStatus::PROTOCOL_ERROR);
                    return false;
                }
                if header.fin {
                    received.chunks.push(self.unwrap_envelope(&payload));
                } else {
                    self.fragments = Some(Fragments {
                        opcode: header.opcode,
                        data: payload,
                    });
                }
                true
            }
            OP_CONTINUATION => {
                let Some(mut fragments) = self.fragments.take() else {
                    self.fail(received, CloseStatus::PROTOCOL_ERROR);
                    return false;
                };
                fragments.data.extend_from_slice(&payload);
                if header.fin {
                    tracing::trace!(opcode = fragments.opcode, len = fragments.data.len(), "Reassembled message");
                    received.chunks.push(self.unwrap_envelope(&fragments.data));
                } else {
                    self.fragments = Some(fragments);
                }
                true
            }
            _ => {
                self.fail(received, CloseStatus::PROTOCOL_ERROR);
                false
            }
        }
    }
}

impl Protocol for WsProtocol {
    fn name(&self) -> &'static str {
        "ws"
    }

    fn send(&mut self, payload: &[u8], headers: &HeaderMap, binary: bool) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        let message = self.wrap(payload, headers)?;
        let opcode = if binary { OP_BINARY } else { OP_TEXT };
        Some(encode_frame(true, opcode, &message, self.outgoing_mask()))
    }

    fn receive(&mut self, bytes: &[u8]) -> Received {
        let mut received = Received::default();
        if self.closed {
            return received;
        }
        self.buffer.extend_from_slice(bytes);

        loop {
            let header = match parse_header(&self.buffer) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(error = %error, "Malformed frame header");
                    self.fail(&mut received, CloseStatus::PROTOCOL_ERROR);
                    break;
                }
            };

            let mask_expected = self.role == Role::Remote;
            if header.mask.is_some() != mask_expected {
                self.fail(&mut received, CloseStatus::PROTOCOL_ERROR);
                break;
            }

            let pending = self.fragments.as_ref().map_or(0, |f| f.data.len() as u64);
            if pending.saturating_add(header.payload_len) > self.max_message_bytes as u64 {
                self.fail(&mut received, CloseStatus::MESSAGE_TOO_BIG);
                break;
            }

            // payload_len is bounded by max_message_bytes here
            let total = header.header_len + header.payload_len as usize;
            if self.buffer.len() < total {
                break;
            }

            let mut payload: Vec<u8> = self.buffer.drain(..total).skip(header.header_len).collect();
            if let Some(key) = header.mask {
                apply_mask(&mut payload, key);
            }
            if !self.handle_frame(header, payload, &mut received) {
                break;
            }
        }
        received
    }

    fn close(&mut self, status: CloseStatus) -> Option<Vec<u8>> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.buffer.clear();
        self.fragments = None;
        Some(self.close_frame(status))
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn keepalive(&mut self) -> Option<Vec<u8>> {
        self.ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BitonCodec, JsonCodec};

    fn json() -> Arc<dyn Codec> {
        Arc::new(JsonCodec::default())
    }

    fn headers(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("@service-id".to_string(), Value::from(id));
        headers
    }

    /// Client frames parsed by a remote-role protocol and vice versa.
    fn pair() -> (WsProtocol, WsProtocol) {
        (WsProtocol::new(Role::Client, json()), WsProtocol::new(Role::Remote, json()))
    }

    #[test]
    fn envelope_round_trips_both_directions() {
        let (mut client, mut remote) = pair();

        let frame = client.send(b"hello", &headers("svc"), false).expect("frame");
        let received = remote.receive(&frame);
        assert_eq!(received.chunks, vec![Chunk { payload: b"hello".to_vec(), headers: headers("svc") }]);
        assert!(received.close.is_none());

        let frame = remote.send(b"back", &HeaderMap::new(), false).expect("frame");
        let received = client.receive(&frame);
        assert_eq!(received.chunks[0].payload, b"back".to_vec());
    }

    /// A payload and headers whose envelope encodes to exactly `target` bytes.
    fn sized_message(protocol: &WsProtocol, target: usize) -> (Vec<u8>, HeaderMap) {
        let mut len = target * 3 / 4;
        loop {
            let payload = vec![7u8; len];
            let mut headers = headers("sized");
            headers.insert("pad".to_string(), Value::from(""));
            let base = protocol.wrap(&payload, &headers).expect("wrap").len();
            if base <= target {
                headers.insert("pad".to_string(), Value::from("x".repeat(target - base)));
                return (payload, headers);
            }
            len = len.saturating_sub(48);
        }
    }

    #[test]
    fn length_boundaries_survive_send_and_receive() {
        for (target, length_field) in [(125, 0), (126, 2), (65535, 2), (65536, 8)] {
            let (mut client, mut remote) = pair();
            let (payload, headers) = sized_message(&client, target);

            let frame = client.send(&payload, &headers, false).expect("frame");
            let header = parse_header(&frame).expect("valid").expect("complete");
            assert_eq!(header.payload_len, target as u64);
            assert_eq!(header.header_len, 2 + length_field + 4);
            assert_eq!(frame.len(), header.header_len + target);
            let received = remote.receive(&frame);
            assert!(received.close.is_none(), "target {}", target);
            assert_eq!(received.chunks, vec![Chunk { payload: payload.clone(), headers: headers.clone() }]);

            let frame = remote.send(&payload, &headers, false).expect("frame");
            let header = parse_header(&frame).expect("valid").expect("complete");
            assert_eq!(header.header_len, 2 + length_field);
            let received = client.receive(&frame);
            assert_eq!(received.chunks, vec![Chunk { payload, headers }]);
        }
    }

    #[test]
    fn binary_codec_uses_binary_opcode() {
        let mut client = WsProtocol::new(Role::Client, Arc::new(BitonCodec::default()));
        let frame = client.send(&[0, 255], &HeaderMap::new(), true).expect("frame");
        assert_eq!(frame[0], 0x80 | OP_BINARY);

        let mut remote = WsProtocol::new(Role::Remote, Arc::new(BitonCodec::default()));
        assert_eq!(remote.receive(&frame).chunks[0].payload, vec![0, 255]);
    }

    #[test]
    fn byte_at_a_time_matches_single_feed() {
        let (mut client, _) = pair();
        let mut stream = Vec::new();
        for i in 0..3 {
            let payload = vec![b'a' + i; 200 * usize::from(i)];
            stream.extend(client.send(&payload, &headers("s"), false).expect("frame"));
        }

        let mut whole = WsProtocol::new(Role::Remote, json());
        let expected = whole.receive(&stream).chunks;
        assert_eq!(expected.len(), 3);

        let mut trickle = WsProtocol::new(Role::Remote, json());
        let mut chunks = Vec::new();
        for byte in &stream {
            chunks.extend(trickle.receive(std::slice::from_ref(byte)).chunks);
        }
        assert_eq!(chunks, expected);
    }

    #[test]
    fn fragmented_message_equals_single_frame() {
        let (mut client, _) = pair();
        let single = client.send(b"fragment me", &headers("f"), false).expect("frame");
        let header = parse_header(&single).expect("valid").expect("complete");
        let mut message = single[header.header_len..].to_vec();
        apply_mask(&mut message, header.mask.expect("client frames are masked"));

        let key = [9, 8, 7, 6];
        let mut stream = Vec::new();
        let pieces: Vec<&[u8]> = message.chunks(4).collect();
        for (i, piece) in pieces.iter().enumerate() {
            let opcode = if i == 0 { OP_TEXT } else { OP_CONTINUATION };
            stream.extend(encode_frame(i == pieces.len() - 1, opcode, piece, Some(key)));
        }

        let mut remote = WsProtocol::new(Role::Remote, json());
        let fragmented = remote.receive(&stream).chunks;
        let mut remote = WsProtocol::new(Role::Remote, json());
        assert_eq!(fragmented, remote.receive(&single).chunks);
        assert_eq!(fragmented[0].payload, b"fragment me".to_vec());
    }

    #[test]
    fn ping_gets_unmasked_pong_on_remote_only() {
        let mut remote = WsProtocol::new(Role::Remote, json());
        let received = remote.receive(&encode_frame(true, OP_PING, &[], Some([1, 2, 3, 4])));
        assert_eq!(received.replies, vec![vec![0x80 | OP_PONG, 0x00]]);

        let mut client = WsProtocol::new(Role::Client, json());
        let received = client.receive(&encode_frame(true, OP_PING, &[], None));
        assert!(received.replies.is_empty());
    }

    #[test]
    fn pong_requests_keepalive_on_client() {
        let mut client = WsProtocol::new(Role::Client, json());
        let received = client.receive(&encode_frame(true, OP_PONG, &[], None));
        assert!(received.keepalive);

        let probe = client.keepalive().expect("ping");
        let header = parse_header(&probe).expect("valid").expect("complete");
        assert_eq!(header.opcode, OP_PING);
        assert!(header.mask.is_some());
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn close_is_echoed_and_reported() {
        let (mut client, mut remote) = pair();
        let close = client.close(CloseStatus::GOING_AWAY).expect("close frame");
        assert_eq!(client.close(CloseStatus::NORMAL), None);
        assert_eq!(client.send(b"x", &HeaderMap::new(), false), None);

        let received = remote.receive(&close);
        assert_eq!(received.close, Some(Closure::Peer(CloseStatus::GOING_AWAY)));
        assert_eq!(received.replies, vec![vec![0x80 | OP_CLOSE, 0x02, 0x03, 0xe8]]);
        assert!(remote.is_closed());
    }

    #[test]
    fn mask_policy_violation_closes_with_1002() {
        let mut remote = WsProtocol::new(Role::Remote, json());
        let received = remote.receive(&encode_frame(true, OP_TEXT, b"{}", None));
        assert_eq!(received.close, Some(Closure::Violation(CloseStatus::PROTOCOL_ERROR)));

        let mut client = WsProtocol::new(Role::Client, json());
        let received = client.receive(&encode_frame(true, OP_TEXT, b"{}", Some([1, 1, 1, 1])));
        assert_eq!(received.close, Some(Closure::Violation(CloseStatus::PROTOCOL_ERROR)));
        // the client's own close frame is masked
        assert_eq!(received.replies[0][1] & 0x80, 0x80);
    }

    #[test]
    fn reserved_opcode_closes_with_1002() {
        let mut remote = WsProtocol::new(Role::Remote, json());
        let received = remote.receive(&[0x83, 0x80, 0, 0, 0, 0]);
        assert_eq!(received.close, Some(Closure::Violation(CloseStatus::PROTOCOL_ERROR)));
        assert_eq!(received.replies, vec![vec![0x80 | OP_CLOSE, 0x02, 0x03, 0xea]]);
    }

    #[test]
    fn oversized_message_closes_with_1009_before_buffering() {
        let mut remote = WsProtocol::with_limit(Role::Remote, json(), 16);
        let mut header = vec![0x82, 0x80 | 126];
        header.extend_from_slice(&1000u16.to_be_bytes());
        header.extend_from_slice(&[0, 0, 0, 0]);
        let received = remote.receive(&header);
        assert_eq!(received.close, Some(Closure::Violation(CloseStatus::MESSAGE_TOO_BIG)));
        assert!(remote.is_closed());
    }

    #[test]
    fn oversized_fragment_total_closes_with_1009() {
        let mut remote = WsProtocol::with_limit(Role::Remote, json(), 8);
        let mut stream = encode_frame(false, OP_TEXT, &[b'a'; 6], Some([0; 4]));
        stream.extend(encode_frame(true, OP_CONTINUATION, &[b'b'; 6], Some([0; 4])));
        let received = remote.receive(&stream);
        assert_eq!(received.close, Some(Closure::Violation(CloseStatus::MESSAGE_TOO_BIG)));
    }

    #[test]
    fn continuation_without_start_is_a_violation() {
        let mut remote = WsProtocol::new(Role::Remote, json());
        let received = remote.receive(&encode_frame(true, OP_CONTINUATION, b"x", Some([0; 4])));
        assert_eq!(received.close, Some(Closure::Violation(CloseStatus::PROTOCOL_ERROR)));
    }

    #[test]
    fn undecodable_envelope_yields_empty_chunk() {
        let mut remote = WsProtocol::new(Role::Remote, json());
        let received = remote.receive(&encode_frame(true, OP_TEXT, b"not json", Some([0; 4])));
        assert_eq!(received.chunks, vec![Chunk::default()]);
    }

    #[test]
    fn bytes_after_close_are_ignored() {
        let (mut client, mut remote) = pair();
        let mut stream = client.close(CloseStatus::NORMAL).expect("close");
        let mut other = WsProtocol::new(Role::Client, json());
        stream.extend(other.send(b"late", &HeaderMap::new(), false).expect("frame"));
        let received = remote.receive(&stream);
        assert!(received.chunks.is_empty());
        assert!(remote.receive(b"more").chunks.is_empty());
    }
}
