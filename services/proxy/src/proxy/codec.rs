//! Game protocol handshake codec.
//!
//! Wire format (all integers are VarInts unless noted):
//!
//! ```text
//! frame   = varint(len(payload)) || payload
//! payload = varint(packet_id = 0)
//!        || varint(protocol_version)
//!        || varint(len(address)) || address (UTF-8)
//!        || u16 big-endian (server_port)
//!        || varint(next_state)
//! ```
//!
//! VarInts carry 7 bits per byte, least-significant group first, with the
//! high bit set on every byte except the last. A 32-bit value never needs
//! more than 5 bytes.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum encoded size of a 32-bit VarInt.
pub const MAX_VARINT_LEN: usize = 5;

/// Handshake frames are tiny; anything outside this range is not a handshake.
pub const MAX_HANDSHAKE_FRAME: i32 = 255;

/// Packet id of the handshake in the handshaking state.
pub const HANDSHAKE_PACKET_ID: i32 = 0;

/// Codec errors. All of them are fatal to the connection being parsed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint longer than {max} bytes", max = MAX_VARINT_LEN)]
    VarIntTooLong,

    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),

    #[error("handshake frame length {0} outside [1, {max}]", max = MAX_HANDSHAKE_FRAME)]
    FrameLength(i32),

    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketId(i32),

    #[error("invalid string length {0}")]
    StringLength(i32),

    #[error("server address is not valid UTF-8")]
    InvalidUtf8,

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends the minimal VarInt encoding of `value`.
///
/// Negative values are encoded through their two's complement bit pattern and
/// therefore always take the full five bytes.
pub fn put_varint(buf: &mut impl BufMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v & 0x7F) as u8 | 0x80);
        v >>= 7;
    }
}

/// Number of bytes [`put_varint`] writes for `value`.
pub fn varint_len(value: i32) -> usize {
    let v = value as u32;
    match v {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}

/// Decodes a VarInt from the front of `buf`, advancing it.
pub fn get_varint(buf: &mut impl Buf) -> Result<i32, ProtocolError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(ProtocolError::Truncated("varint"));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

/// Reads a VarInt one byte at a time from an async stream.
pub async fn read_varint<R>(reader: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

fn get_string(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    let len = get_varint(buf)?;
    if len < 0 {
        return Err(ProtocolError::StringLength(len));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated("server address"));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// The first packet a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    /// Hostname the client typed, possibly followed by `\0`-separated
    /// compatibility data from modded clients.
    pub server_address: String,
    pub server_port: u16,
    /// 1 = status, 2 = login.
    pub next_state: i32,
}

impl Handshake {
    /// Decodes the packet payload (everything after the outer length).
    pub fn decode_payload(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        let packet_id = get_varint(&mut payload)?;
        if packet_id != HANDSHAKE_PACKET_ID {
            return Err(ProtocolError::UnexpectedPacketId(packet_id));
        }

        let protocol_version = get_varint(&mut payload)?;
        let server_address = get_string(&mut payload)?;
        if payload.remaining() < 2 {
            return Err(ProtocolError::Truncated("server port"));
        }
        let server_port = payload.get_u16();
        let next_state = get_varint(&mut payload)?;

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    /// Decodes a complete frame, outer length included.
    pub fn decode_frame(mut frame: &[u8]) -> Result<Self, ProtocolError> {
        let len = get_varint(&mut frame)?;
        if !(1..=MAX_HANDSHAKE_FRAME).contains(&len) {
            return Err(ProtocolError::FrameLength(len));
        }
        if frame.len() < len as usize {
            return Err(ProtocolError::Truncated("frame"));
        }
        Self::decode_payload(&frame[..len as usize])
    }

    /// Reads exactly one framed handshake from the stream.
    ///
    /// Bytes the client sent after the frame stay unread in the stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let len = read_varint(reader).await?;
        if !(1..=MAX_HANDSHAKE_FRAME).contains(&len) {
            return Err(ProtocolError::FrameLength(len));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::Truncated("frame")
            } else {
                ProtocolError::Io(e)
            }
        })?;
        Self::decode_payload(&payload)
    }

    fn payload_len(&self) -> usize {
        varint_len(HANDSHAKE_PACKET_ID)
            + varint_len(self.protocol_version)
            + varint_len(self.server_address.len() as i32)
            + self.server_address.len()
            + 2
            + varint_len(self.next_state)
    }

    /// Encodes the packet payload without the outer length.
    pub fn encode_payload(&self, buf: &mut impl BufMut) {
        put_varint(buf, HANDSHAKE_PACKET_ID);
        put_varint(buf, self.protocol_version);
        put_varint(buf, self.server_address.len() as i32);
        buf.put_slice(self.server_address.as_bytes());
        buf.put_u16(self.server_port);
        put_varint(buf, self.next_state);
    }

    /// Encodes the full frame, outer length included.
    pub fn encode_frame(&self) -> BytesMut {
        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(varint_len(payload_len as i32) + payload_len);
        put_varint(&mut buf, payload_len as i32);
        self.encode_payload(&mut buf);
        buf
    }

    /// The routing hostname: everything before the first `\0`.
    pub fn hostname(&self) -> &str {
        match self.server_address.split_once('\0') {
            Some((host, _)) => host,
            None => &self.server_address,
        }
    }

    /// Compatibility data after the first `\0`, if the client sent any.
    pub fn compat_marker(&self) -> Option<&str> {
        self.server_address
            .split_once('\0')
            .map(|(_, marker)| marker)
    }

    /// Copy of this handshake addressed at a backend.
    ///
    /// The hostname segment becomes `localhost`; a compatibility marker is
    /// carried over byte for byte since modded backends negotiate with it.
    pub fn rewritten_for_backend(&self, backend_port: u16) -> Self {
        let server_address = match self.compat_marker() {
            Some(marker) => format!("localhost\0{}", marker),
            None => "localhost".to_string(),
        };
        Self {
            protocol_version: self.protocol_version,
            server_address,
            server_port: backend_port,
            next_state: self.next_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        put_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_varint_known_values() {
        let cases: [i32; 8] = [0, 1, 127, 128, 16383, 16384, 2097151, 2147483647];
        for value in cases {
            let bytes = encode(value);
            assert_eq!(bytes.len(), varint_len(value), "length of {}", value);
            assert_eq!(get_varint(&mut bytes.as_slice()).unwrap(), value);
        }
        assert_eq!(encode(300), vec![0xAC, 0x02]);
        assert_eq!(encode(2147483647), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
        assert_eq!(encode(-1), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_varint_too_long() {
        let bytes = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(
            get_varint(&mut &bytes[..]),
            Err(ProtocolError::VarIntTooLong)
        ));
    }

    #[test]
    fn test_varint_truncated() {
        let bytes = [0x80u8, 0x80];
        assert!(matches!(
            get_varint(&mut &bytes[..]),
            Err(ProtocolError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn test_read_varint_stream() {
        let bytes: &[u8] = &[0xAC, 0x02, 0x99];
        let mut reader = bytes;
        assert_eq!(read_varint(&mut reader).await.unwrap(), 300);
        assert_eq!(reader, &[0x99]);

        let mut too_long: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            read_varint(&mut too_long).await,
            Err(ProtocolError::VarIntTooLong)
        ));

        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_varint(&mut empty).await,
            Err(ProtocolError::Io(_))
        ));
    }

    fn forge_handshake() -> Handshake {
        Handshake {
            protocol_version: 763,
            server_address: "play.example.com\0FML\02.2.0".to_string(),
            server_port: 25565,
            next_state: 2,
        }
    }

    #[test]
    fn test_handshake_frame_roundtrip() {
        let hs = forge_handshake();
        let frame = hs.encode_frame();
        let decoded = Handshake::decode_frame(&frame).unwrap();
        assert_eq!(decoded, hs);
        assert_eq!(decoded.encode_frame(), frame);
    }

    #[test]
    fn test_handshake_known_bytes() {
        let hs = Handshake {
            protocol_version: 47,
            server_address: "a".to_string(),
            server_port: 25565,
            next_state: 1,
        };
        let frame = hs.encode_frame();
        assert_eq!(
            frame.as_ref(),
            &[0x07, 0x00, 0x2F, 0x01, b'a', 0x63, 0xDD, 0x01]
        );
    }

    #[test]
    fn test_hostname_and_marker() {
        let hs = forge_handshake();
        assert_eq!(hs.hostname(), "play.example.com");
        assert_eq!(hs.compat_marker(), Some("FML\x002.2.0"));

        let plain = Handshake {
            server_address: "Play.Example.com".to_string(),
            ..forge_handshake()
        };
        assert_eq!(plain.hostname(), "Play.Example.com");
        assert_eq!(plain.compat_marker(), None);
    }

    #[test]
    fn test_rewrite_preserves_marker() {
        let rewritten = forge_handshake().rewritten_for_backend(25566);
        assert_eq!(rewritten.server_address, "localhost\0FML\x002.2.0");
        assert_eq!(rewritten.server_port, 25566);
        assert_eq!(rewritten.next_state, 2);
        assert_eq!(rewritten.protocol_version, 763);

        let plain = Handshake {
            server_address: "play.example.com".to_string(),
            ..forge_handshake()
        };
        assert_eq!(
            plain.rewritten_for_backend(25565).server_address,
            "localhost"
        );
    }

    #[test]
    fn test_frame_length_bounds() {
        assert!(matches!(
            Handshake::decode_frame(&[0x00]),
            Err(ProtocolError::FrameLength(0))
        ));
        // 256 encoded as a varint.
        assert!(matches!(
            Handshake::decode_frame(&[0x80, 0x02]),
            Err(ProtocolError::FrameLength(256))
        ));
        assert_eq!(
            ProtocolError::FrameLength(256).to_string(),
            format!("handshake frame length 256 outside [1, {MAX_HANDSHAKE_FRAME}]")
        );
    }

    #[test]
    fn test_non_handshake_packet_id() {
        let frame = [0x02u8, 0x01, 0x00];
        assert!(matches!(
            Handshake::decode_frame(&frame),
            Err(ProtocolError::UnexpectedPacketId(1))
        ));
    }

    #[test]
    fn test_truncated_fields() {
        let frame = forge_handshake().encode_frame();
        // Cut inside the payload but keep the original outer length.
        let cut = &frame[..frame.len() - 3];
        assert!(matches!(
            Handshake::decode_frame(cut),
            Err(ProtocolError::Truncated(_))
        ));

        // Address length pointing past the end of the payload.
        let payload = [0x00u8, 0x2F, 0x10, b'a', b'b'];
        assert!(matches!(
            Handshake::decode_payload(&payload),
            Err(ProtocolError::Truncated("server address"))
        ));

        // Missing port.
        let payload = [0x00u8, 0x2F, 0x01, b'a', 0x63];
        assert!(matches!(
            Handshake::decode_payload(&payload),
            Err(ProtocolError::Truncated("server port"))
        ));
    }

    #[tokio::test]
    async fn test_read_from_leaves_trailing_bytes() {
        let hs = forge_handshake();
        let mut wire = hs.encode_frame().to_vec();
        wire.extend_from_slice(&[0x01, 0x00]); // status request
        let mut reader = wire.as_slice();

        let decoded = Handshake::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, hs);
        assert_eq!(reader, &[0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_read_from_truncated_frame() {
        let frame = forge_handshake().encode_frame();
        let mut reader = &frame[..10];
        assert!(matches!(
            Handshake::read_from(&mut reader).await,
            Err(ProtocolError::Truncated("frame"))
        ));
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(value in any::<i32>()) {
            let bytes = encode(value);
            prop_assert!(bytes.len() <= MAX_VARINT_LEN);
            prop_assert_eq!(bytes.len(), varint_len(value));
            prop_assert_eq!(get_varint(&mut bytes.as_slice()).unwrap(), value);
        }

        #[test]
        fn prop_handshake_roundtrip(
            protocol_version in 0i32..=100_000,
            host in "[a-z0-9.-]{1,48}",
            marker in proptest::option::of("[A-Z0-9.]{1,12}"),
            server_port in any::<u16>(),
            next_state in 1i32..=3,
        ) {
            let server_address = match marker {
                Some(m) => format!("{}\0FML\0{}", host, m),
                None => host,
            };
            let hs = Handshake { protocol_version, server_address, server_port, next_state };
            let frame = hs.encode_frame();
            let decoded = Handshake::decode_frame(&frame).unwrap();
            prop_assert_eq!(&decoded, &hs);
            prop_assert_eq!(decoded.encode_frame(), frame);
        }
    }
}
