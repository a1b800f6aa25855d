//! Encode and decode the frames that carry bulk terminal I/O between
//! the session core and a UI endpoint.
//! Each frame is `[type:1][length:4 big-endian][payload:length]`.
//! The framer only moves bytes; it never interprets terminal escape
//! sequences.  Length and type violations are surfaced as typed errors
//! so that the endpoint owner can reply with a ProtocolError frame and
//! shut the endpoint down without disturbing any other session.

use smol::io::{AsyncReadExt, AsyncWriteExt};
use std::io::Cursor;
use thiserror::Error;

/// Version string exchanged in the Handshake frame on a new endpoint.
pub const PROTOCOL_VERSION: &[u8; 4] = b"V001";

/// Default cap on a single frame payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

const FRAME_HANDSHAKE: u8 = 0x00;
const FRAME_INPUT: u8 = 0x01;
const FRAME_OUTPUT: u8 = 0x02;
const FRAME_RESIZE: u8 = 0x03;
const FRAME_BELL: u8 = 0x04;
const FRAME_ACK: u8 = 0x05;
const FRAME_PROTOCOL_ERROR: u8 = 0x06;

const HEADER_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame payload length {length} exceeds cap of {cap} bytes")]
    PayloadTooLarge { length: u32, cap: usize },
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("resize payload must be 4 bytes, got {0}")]
    MalformedResize(usize),
    #[error("handshake payload must be 4 bytes, got {0}")]
    MalformedHandshake(usize),
    #[error("protocol error reason is not valid utf-8")]
    BadErrorReason(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether this error condition is a peer protocol violation
    /// (as opposed to plain transport I/O trouble).
    pub fn is_violation(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Version handshake; the payload is the 4-byte version string.
    Handshake([u8; 4]),
    /// Raw bytes from the UI towards the channel.
    Input(Vec<u8>),
    /// Raw bytes from the channel towards the UI.
    Output(Vec<u8>),
    /// rows, cols
    Resize { rows: u16, cols: u16 },
    Bell,
    Ack,
    /// UTF-8 reason; sending this frame is the last act of an endpoint.
    ProtocolError(String),
    /// A well-framed payload with a type tag we don't understand.
    /// Only produced in non-strict mode; strict decoding rejects it.
    Unknown { frame_type: u8, length: u32 },
}

impl Frame {
    pub fn frame_type(&self) -> u8 {
        match self {
            Frame::Handshake(_) => FRAME_HANDSHAKE,
            Frame::Input(_) => FRAME_INPUT,
            Frame::Output(_) => FRAME_OUTPUT,
            Frame::Resize { .. } => FRAME_RESIZE,
            Frame::Bell => FRAME_BELL,
            Frame::Ack => FRAME_ACK,
            Frame::ProtocolError(_) => FRAME_PROTOCOL_ERROR,
            Frame::Unknown { frame_type, .. } => *frame_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "Handshake",
            Frame::Input(_) => "Input",
            Frame::Output(_) => "Output",
            Frame::Resize { .. } => "Resize",
            Frame::Bell => "Bell",
            Frame::Ack => "Ack",
            Frame::ProtocolError(_) => "ProtocolError",
            Frame::Unknown { .. } => "Unknown",
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Frame::Handshake(vers) => vers.to_vec(),
            Frame::Input(data) | Frame::Output(data) => data.clone(),
            Frame::Resize { rows, cols } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&rows.to_be_bytes());
                buf.extend_from_slice(&cols.to_be_bytes());
                buf
            }
            Frame::Bell | Frame::Ack => vec![],
            Frame::ProtocolError(reason) => reason.as_bytes().to_vec(),
            Frame::Unknown { .. } => vec![],
        }
    }
}

/// The codec carries the decode policy: the payload cap and whether
/// unknown frame types are fatal.  Encoding is policy-free.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    strict: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            strict: true,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload(mut self, cap: usize) -> Self {
        self.max_payload = cap;
        self
    }

    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn encode<W: std::io::Write>(&self, frame: &Frame, mut w: W) -> Result<(), FrameError> {
        let buffer = self.encode_to_vec(frame);
        w.write_all(&buffer)?;
        Ok(())
    }

    pub async fn encode_async<W: Unpin + AsyncWriteExt>(
        &self,
        frame: &Frame,
        w: &mut W,
    ) -> Result<(), FrameError> {
        let buffer = self.encode_to_vec(frame);
        w.write_all(&buffer).await?;
        Ok(())
    }

    /// Single-buffer the header and payload; endpoints run with nodelay
    /// enabled and we want the header to go out in the same packet as
    /// the payload.
    pub fn encode_to_vec(&self, frame: &Frame) -> Vec<u8> {
        let payload = frame.payload();
        let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
        buffer.push(frame.frame_type());
        buffer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&payload);
        metrics::histogram!("wire.encode.size").record(buffer.len() as f64);
        buffer
    }

    pub fn decode<R: std::io::Read>(&self, mut r: R) -> Result<Frame, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header)?;
        let frame_type = header[0];
        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        self.check_header(frame_type, length)?;

        let mut payload = vec![0u8; length as usize];
        r.read_exact(&mut payload)?;
        self.assemble(frame_type, payload)
    }

    pub async fn decode_async<R: Unpin + AsyncReadExt>(
        &self,
        r: &mut R,
    ) -> Result<Frame, FrameError> {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header).await?;
        let frame_type = header[0];
        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        self.check_header(frame_type, length)?;

        let mut payload = vec![0u8; length as usize];
        r.read_exact(&mut payload).await?;
        self.assemble(frame_type, payload)
    }

    fn check_header(&self, frame_type: u8, length: u32) -> Result<(), FrameError> {
        if length as usize > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                length,
                cap: self.max_payload,
            });
        }
        if self.strict && !known_frame_type(frame_type) {
            return Err(FrameError::UnknownType(frame_type));
        }
        Ok(())
    }

    fn assemble(&self, frame_type: u8, payload: Vec<u8>) -> Result<Frame, FrameError> {
        metrics::histogram!("wire.decode.size").record(payload.len() as f64);
        match frame_type {
            FRAME_HANDSHAKE => {
                if payload.len() != 4 {
                    return Err(FrameError::MalformedHandshake(payload.len()));
                }
                let mut vers = [0u8; 4];
                vers.copy_from_slice(&payload);
                Ok(Frame::Handshake(vers))
            }
            FRAME_INPUT => Ok(Frame::Input(payload)),
            FRAME_OUTPUT => Ok(Frame::Output(payload)),
            FRAME_RESIZE => {
                if payload.len() != 4 {
                    return Err(FrameError::MalformedResize(payload.len()));
                }
                Ok(Frame::Resize {
                    rows: u16::from_be_bytes([payload[0], payload[1]]),
                    cols: u16::from_be_bytes([payload[2], payload[3]]),
                })
            }
            FRAME_BELL => Ok(Frame::Bell),
            FRAME_ACK => Ok(Frame::Ack),
            FRAME_PROTOCOL_ERROR => Ok(Frame::ProtocolError(String::from_utf8(payload)?)),
            other => Ok(Frame::Unknown {
                frame_type: other,
                length: payload.len() as u32,
            }),
        }
    }

    /// Attempt to decode a frame from the front of `buffer`, consuming
    /// the decoded bytes on success.  Returns `Ok(None)` if the buffer
    /// does not yet hold a complete frame.
    pub fn stream_decode(&self, buffer: &mut Vec<u8>) -> Result<Option<Frame>, FrameError> {
        let mut cursor = Cursor::new(buffer.as_slice());
        match self.decode(&mut cursor) {
            Ok(frame) => {
                let consumed = cursor.position() as usize;
                buffer.drain(0..consumed);
                Ok(Some(frame))
            }
            Err(FrameError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Read from a (possibly non-blocking) stream, accumulating into
    /// `buffer` until a complete frame is available.  `Ok(None)` means
    /// the stream would block before a full frame arrived.
    pub fn try_read_and_decode<R: std::io::Read>(
        &self,
        r: &mut R,
        buffer: &mut Vec<u8>,
    ) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = self.stream_decode(buffer)? {
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let size = match r.read(&mut buf) {
                Ok(size) => size,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            if size == 0 {
                return Err(FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "End Of File",
                )));
            }

            buffer.extend_from_slice(&buf[0..size]);
        }
    }
}

fn known_frame_type(t: u8) -> bool {
    (FRAME_HANDSHAKE..=FRAME_PROTOCOL_ERROR).contains(&t)
}

/// Send our version and require the matching version back.
pub fn client_handshake<S: std::io::Read + std::io::Write>(
    codec: &FrameCodec,
    stream: &mut S,
) -> Result<(), FrameError> {
    codec.encode(&Frame::Handshake(*PROTOCOL_VERSION), &mut *stream)?;
    match codec.decode(&mut *stream)? {
        Frame::Handshake(vers) if &vers == PROTOCOL_VERSION => Ok(()),
        Frame::Handshake(vers) => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("server speaks version {:?}", vers),
        ))),
        Frame::ProtocolError(reason) => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            reason,
        ))),
        other => Err(FrameError::UnknownType(other.frame_type())),
    }
}

/// Answer a client handshake, or reject with a ProtocolError frame.
pub fn server_handshake<S: std::io::Read + std::io::Write>(
    codec: &FrameCodec,
    stream: &mut S,
) -> Result<(), FrameError> {
    match codec.decode(&mut *stream)? {
        Frame::Handshake(vers) if &vers == PROTOCOL_VERSION => {
            codec.encode(&Frame::Handshake(*PROTOCOL_VERSION), &mut *stream)?;
            Ok(())
        }
        Frame::Handshake(vers) => {
            let reason = format!("unsupported protocol version {:?}", vers);
            codec.encode(&Frame::ProtocolError(reason.clone()), &mut *stream)?;
            Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                reason,
            )))
        }
        other => {
            codec.encode(
                &Frame::ProtocolError("expected version handshake".to_string()),
                &mut *stream,
            )?;
            Err(FrameError::UnknownType(other.frame_type()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame() {
        let codec = FrameCodec::new();
        let mut encoded = Vec::new();
        codec
            .encode(&Frame::Input(b"hello".to_vec()), &mut encoded)
            .unwrap();
        assert_eq!(&encoded, b"\x01\x00\x00\x00\x05hello");
        let decoded = codec.decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, Frame::Input(b"hello".to_vec()));
    }

    #[test]
    fn test_empty_frames() {
        let codec = FrameCodec::new();
        for frame in [Frame::Bell, Frame::Ack] {
            let mut encoded = Vec::new();
            codec.encode(&frame, &mut encoded).unwrap();
            assert_eq!(encoded.len(), 5);
            assert_eq!(codec.decode(encoded.as_slice()).unwrap(), frame);
        }
    }

    #[test]
    fn test_resize_wire_format() {
        let codec = FrameCodec::new();
        let mut encoded = Vec::new();
        codec
            .encode(&Frame::Resize { rows: 24, cols: 80 }, &mut encoded)
            .unwrap();
        assert_eq!(&encoded, b"\x03\x00\x00\x00\x04\x00\x18\x00\x50");
        assert_eq!(
            codec.decode(encoded.as_slice()).unwrap(),
            Frame::Resize { rows: 24, cols: 80 }
        );
    }

    #[test]
    fn test_frame_lengths() {
        let codec = FrameCodec::new();
        for target_len in &[1usize, 128, 247, 256, 65536, DEFAULT_MAX_PAYLOAD] {
            let mut payload = Vec::with_capacity(*target_len);
            payload.resize(*target_len, b'a');
            let mut encoded = Vec::new();
            codec
                .encode(&Frame::Output(payload.clone()), &mut encoded)
                .unwrap();
            let decoded = codec.decode(encoded.as_slice()).unwrap();
            assert_eq!(decoded, Frame::Output(payload));
        }
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let codec = FrameCodec::new().with_max_payload(16);
        let mut encoded = Vec::new();
        encoded.push(0x01);
        encoded.extend_from_slice(&17u32.to_be_bytes());
        encoded.extend_from_slice(&[0u8; 17]);
        let err = codec.decode(encoded.as_slice()).unwrap_err();
        assert!(err.is_violation());
        assert!(matches!(
            err,
            FrameError::PayloadTooLarge { length: 17, cap: 16 }
        ));
    }

    #[test]
    fn test_unknown_type_strict() {
        let codec = FrameCodec::new();
        let mut encoded = Vec::new();
        encoded.push(0x7f);
        encoded.extend_from_slice(&0u32.to_be_bytes());
        let err = codec.decode(encoded.as_slice()).unwrap_err();
        assert!(matches!(err, FrameError::UnknownType(0x7f)));
        assert!(err.is_violation());
    }

    #[test]
    fn test_unknown_type_lenient() {
        let codec = FrameCodec::new().lenient();
        let mut encoded = Vec::new();
        encoded.push(0x7f);
        encoded.extend_from_slice(&3u32.to_be_bytes());
        encoded.extend_from_slice(b"abc");
        assert_eq!(
            codec.decode(encoded.as_slice()).unwrap(),
            Frame::Unknown {
                frame_type: 0x7f,
                length: 3
            }
        );
    }

    #[test]
    fn stream_decode_partial() {
        let codec = FrameCodec::new();
        let mut encoded = Vec::new();
        codec
            .encode(&Frame::Input(b"id\n".to_vec()), &mut encoded)
            .unwrap();
        codec.encode(&Frame::Bell, &mut encoded).unwrap();

        // Feed the bytes one at a time; a frame should pop out only
        // once enough bytes have accumulated.
        let mut buffer = Vec::new();
        let mut decoded = Vec::new();
        for byte in encoded {
            buffer.push(byte);
            if let Some(frame) = codec.stream_decode(&mut buffer).unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(
            decoded,
            vec![Frame::Input(b"id\n".to_vec()), Frame::Bell]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn try_read_and_decode_eof() {
        let codec = FrameCodec::new();
        let mut encoded = Vec::new();
        codec.encode(&Frame::Ack, &mut encoded).unwrap();

        let mut cursor = Cursor::new(encoded.as_slice());
        let mut buffer = Vec::new();
        assert_eq!(
            codec
                .try_read_and_decode(&mut cursor, &mut buffer)
                .unwrap(),
            Some(Frame::Ack)
        );
        let err = codec
            .try_read_and_decode(&mut cursor, &mut buffer)
            .unwrap_err();
        match err {
            FrameError::Io(ioerr) => {
                assert_eq!(ioerr.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_handshake_pair() {
        use std::io::{Read, Write};

        // A toy duplex "stream" backed by two byte buffers.
        struct Pipe {
            incoming: Cursor<Vec<u8>>,
            outgoing: Vec<u8>,
        }
        impl Read for Pipe {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.incoming.read(buf)
            }
        }
        impl Write for Pipe {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                std::io::Write::write(&mut self.outgoing, buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let codec = FrameCodec::new();
        let client_hello = codec.encode_to_vec(&Frame::Handshake(*PROTOCOL_VERSION));

        let mut server = Pipe {
            incoming: Cursor::new(client_hello),
            outgoing: Vec::new(),
        };
        server_handshake(&codec, &mut server).unwrap();

        let mut client = Pipe {
            incoming: Cursor::new(server.outgoing),
            outgoing: Vec::new(),
        };
        client_handshake(&codec, &mut client).unwrap();
    }

    #[test]
    fn test_handshake_rejects_bad_version() {
        let codec = FrameCodec::new();
        let hello = codec.encode_to_vec(&Frame::Handshake(*b"V999"));

        struct Pipe(Cursor<Vec<u8>>, Vec<u8>);
        impl std::io::Read for Pipe {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl std::io::Write for Pipe {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.1.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut server = Pipe(Cursor::new(hello), Vec::new());
        assert!(server_handshake(&codec, &mut server).is_err());
        // The reject must be a ProtocolError frame with a non-empty reason
        match codec.decode(server.1.as_slice()).unwrap() {
            Frame::ProtocolError(reason) => assert!(!reason.is_empty()),
            other => panic!("expected ProtocolError, got {:?}", other),
        }
    }

    #[test]
    fn test_protocol_error_roundtrip() {
        let codec = FrameCodec::new();
        let frame = Frame::ProtocolError("length out of range".to_string());
        let mut encoded = Vec::new();
        codec.encode(&frame, &mut encoded).unwrap();
        assert_eq!(codec.decode(encoded.as_slice()).unwrap(), frame);
    }
}
