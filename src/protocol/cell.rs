//! Tor cell protocol
//!
//! Implements the Tor cell format for communication with relays. Cells are
//! the basic unit of the link layer: fixed 514-byte cells on link protocol
//! v4+, and variable-length cells (2-byte big-endian length) for commands
//! >= 128 plus VERSIONS.
//!
//! The relay-cell digest field is not computed here; it is stamped in by the
//! circuit engine using the hop's rolling digest state.

use crate::error::{Result, TorError};

/// Cell command types (closed enum; unknown commands surface as
/// [`CellError::UnknownCommand`] and are dropped by the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link padding, ignored
    Padding = 0,
    /// CREATE - create a circuit (deprecated, TAP)
    Create = 1,
    /// CREATED - circuit created (deprecated, TAP)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (deprecated)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (deprecated)
    CreatedFast = 6,
    /// VERSIONS - negotiate link protocol versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell permitted to carry EXTEND
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - padding negotiation, treated as no-op
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding, ignored
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge (ignored by clients)
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate (responders only)
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Variable-length cells carry a 2-byte length instead of fixed padding.
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// Byte-level framing convention for a command we do not recognize.
pub fn raw_command_is_variable_length(cmd: u8) -> bool {
    cmd == CellCommand::Versions as u8 || cmd >= 128
}

/// Decode failure for a single cell.
#[derive(Debug)]
pub enum CellError {
    /// Reader produced fewer bytes than the frame requires
    ShortRead,
    /// Command byte outside the closed enum; the raw cell is preserved so
    /// upper layers can log and drop it without killing the link
    UnknownCommand {
        circ_id: u32,
        command: u8,
        payload: Vec<u8>,
    },
    /// Variable-length payload exceeds the u16 length field
    PayloadTooLong,
}

impl From<CellError> for TorError {
    fn from(err: CellError) -> Self {
        match err {
            CellError::ShortRead => TorError::Protocol("short read while decoding cell".into()),
            CellError::UnknownCommand { command, .. } => {
                TorError::Protocol(format!("unknown cell command {}", command))
            }
            CellError::PayloadTooLong => TorError::Protocol("cell payload too long".into()),
        }
    }
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (4 bytes on link protocol v4+)
    pub circ_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload (509 bytes for fixed-length cells, up to 65535 for variable)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Cell size (514 bytes total: 4 circ_id + 1 command + 509 payload)
    pub const SIZE: usize = 514;

    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell
    pub fn new(circ_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circ_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circ_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circ_id, CellCommand::Relay, relay_payload)
    }

    /// Create a RELAY_EARLY cell (circuit extension)
    pub fn relay_early(circ_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circ_id, CellCommand::RelayEarly, relay_payload)
    }

    /// Create a DESTROY cell with the given reason byte
    pub fn destroy(circ_id: u32, reason: u8) -> Self {
        Self::new(circ_id, CellCommand::Destroy, vec![reason])
    }

    /// Serialize cell to wire bytes.
    ///
    /// Fixed cells are padded to 514 bytes; variable cells carry a 2-byte
    /// big-endian length. All multi-byte integers are big-endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.command.is_variable_length() {
            let len: u16 = self
                .payload
                .len()
                .try_into()
                .map_err(|_| TorError::Protocol("variable cell payload exceeds 65535".into()))?;
            let mut buf = Vec::with_capacity(7 + self.payload.len());
            buf.extend_from_slice(&self.circ_id.to_be_bytes());
            buf.push(self.command as u8);
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&self.payload);
            Ok(buf)
        } else {
            if self.payload.len() > Self::PAYLOAD_SIZE {
                return Err(TorError::Protocol(format!(
                    "fixed cell payload {} exceeds {}",
                    self.payload.len(),
                    Self::PAYLOAD_SIZE
                )));
            }
            let mut buf = Vec::with_capacity(Self::SIZE);
            buf.extend_from_slice(&self.circ_id.to_be_bytes());
            buf.push(self.command as u8);
            buf.extend_from_slice(&self.payload);
            buf.resize(Self::SIZE, 0);
            Ok(buf)
        }
    }

    /// Decode exactly one cell from a blocking reader.
    ///
    /// The reader must produce exactly the framed length; an under-read
    /// fails with [`CellError::ShortRead`].
    pub fn decode(reader: &mut impl std::io::Read) -> std::result::Result<Cell, CellError> {
        let mut header = [0u8; 5];
        read_exact(reader, &mut header)?;

        let circ_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let raw_cmd = header[4];

        let payload = if raw_command_is_variable_length(raw_cmd) {
            let mut len_buf = [0u8; 2];
            read_exact(reader, &mut len_buf)?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            read_exact(reader, &mut payload)?;
            payload
        } else {
            let mut payload = vec![0u8; Self::PAYLOAD_SIZE];
            read_exact(reader, &mut payload)?;
            payload
        };

        match CellCommand::from_u8(raw_cmd) {
            Some(command) => Ok(Cell {
                circ_id,
                command,
                payload,
            }),
            None => Err(CellError::UnknownCommand {
                circ_id,
                command: raw_cmd,
                payload,
            }),
        }
    }
}

fn read_exact(
    reader: &mut impl std::io::Read,
    buf: &mut [u8],
) -> std::result::Result<(), CellError> {
    reader.read_exact(buf).map_err(|_| CellError::ShortRead)
}

/// Relay command types (payload commands within RELAY / RELAY_EARLY cells)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated, TAP)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated, TAP)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding, ignored
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory stream at this hop
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
    /// ESTABLISH_RENDEZVOUS - set up a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client to introduction point
    Introduce1 = 34,
    /// RENDEZVOUS2 - service to client at the rendezvous point
    Rendezvous2 = 37,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point acknowledgement
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - introduction point acknowledgement
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            37 => Some(RelayCommand::Rendezvous2),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }

    /// Commands addressed to a stream must carry a nonzero stream-id;
    /// circuit-scoped commands carry zero.
    pub fn expects_stream_id(self) -> bool {
        matches!(
            self,
            RelayCommand::Begin
                | RelayCommand::Data
                | RelayCommand::End
                | RelayCommand::Connected
                | RelayCommand::BeginDir
                | RelayCommand::Resolve
                | RelayCommand::Resolved
        )
    }
}

/// Relay cell (payload within a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized: zero after successful decryption at the destination hop.
    /// Necessary but not sufficient; the digest match confirms delivery.
    pub recognized: u16,

    /// Stream ID (0 for circuit-scoped commands)
    pub stream_id: u16,

    /// Digest (4 bytes, truncated rolling SHA-1; stamped by the engine)
    pub digest: [u8; 4],

    /// Length of data
    pub length: u16,

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay header size: command(1) + recognized(2) + stream_id(2) +
    /// digest(4) + length(2)
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data size in a relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE; // 498

    /// Create a new relay cell with zeroed recognized/digest fields
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::Protocol(format!(
                "relay cell data {} exceeds {}",
                data.len(),
                Self::MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        })
    }

    /// Serialize to a full 509-byte RELAY cell payload, zero-padded.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::Protocol("relay cell data too long".into()));
        }
        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_SIZE, 0);
        Ok(buf)
    }

    /// Parse a decrypted 509-byte relay payload.
    ///
    /// A stream-addressed command with stream-id 0 is a protocol violation.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(TorError::Protocol("relay cell too short".into()));
        }

        let command = RelayCommand::from_u8(payload[0])
            .ok_or_else(|| TorError::Protocol(format!("unknown relay command {}", payload[0])))?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]);

        let data_end = Self::HEADER_SIZE + length as usize;
        if data_end > payload.len() {
            return Err(TorError::Protocol("relay cell data truncated".into()));
        }
        if command.expects_stream_id() && stream_id == 0 {
            return Err(TorError::Protocol(format!(
                "stream-addressed relay command {:?} with stream-id 0",
                command
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data: payload[Self::HEADER_SIZE..data_end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_fixed_cell_roundtrip() {
        let cell = Cell::new(12345, CellCommand::Create2, vec![1, 2, 3, 4]);
        let bytes = cell.encode().unwrap();
        assert_eq!(bytes.len(), Cell::SIZE);

        let parsed = Cell::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed.circ_id, 12345);
        assert_eq!(parsed.command, CellCommand::Create2);
        assert_eq!(&parsed.payload[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_variable_cell_roundtrip() {
        let cell = Cell::new(0, CellCommand::Versions, vec![0, 4, 0, 5]);
        let bytes = cell.encode().unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 2 + 4);
        assert_eq!(&bytes[5..7], &[0, 4]); // big-endian length

        let parsed = Cell::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed.command, CellCommand::Versions);
        assert_eq!(parsed.payload, vec![0, 4, 0, 5]);
    }

    #[test]
    fn test_variable_cell_max_length() {
        let cell = Cell::new(0, CellCommand::Vpadding, vec![0u8; 65535]);
        let bytes = cell.encode().unwrap();
        let parsed = Cell::decode(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(parsed.payload.len(), 65535);

        let too_long = Cell::new(0, CellCommand::Vpadding, vec![0u8; 65536]);
        assert!(too_long.encode().is_err());
    }

    #[test]
    fn test_short_read() {
        let cell = Cell::new(7, CellCommand::Relay, vec![0u8; 100]);
        let bytes = cell.encode().unwrap();
        let result = Cell::decode(&mut Cursor::new(&bytes[..200]));
        assert!(matches!(result, Err(CellError::ShortRead)));
    }

    #[test]
    fn test_unknown_command_preserves_raw_cell() {
        let mut bytes = vec![0, 0, 0, 9]; // circ_id 9
        bytes.push(200); // unknown, >= 128 so variable-length framing
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);

        match Cell::decode(&mut Cursor::new(&bytes)) {
            Err(CellError::UnknownCommand {
                circ_id,
                command,
                payload,
            }) => {
                assert_eq!(circ_id, 9);
                assert_eq!(command, 200);
                assert_eq!(payload, vec![0xaa, 0xbb, 0xcc]);
            }
            other => panic!("expected UnknownCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_relay_cell_scenario() {
        // RELAY DATA, stream 42, body "hello": the end-to-end shape from a
        // client-originated circuit.
        let relay = RelayCell::new(RelayCommand::Data, 42, b"hello".to_vec()).unwrap();
        let payload = relay.encode().unwrap();
        assert_eq!(payload.len(), Cell::PAYLOAD_SIZE);

        let cell = Cell::relay(0x8000_0001, payload);
        let bytes = cell.encode().unwrap();
        assert_eq!(bytes.len(), 514);

        let parsed_cell = Cell::decode(&mut Cursor::new(&bytes)).unwrap();
        let parsed = RelayCell::decode(&parsed_cell.payload).unwrap();
        assert_eq!(parsed.command as u8, 2);
        assert_eq!(parsed.stream_id, 42);
        assert_eq!(parsed.recognized, 0);
        assert_eq!(parsed.length, 5);
        assert_eq!(parsed.data, b"hello");
    }

    #[test]
    fn test_stream_command_with_zero_stream_id_rejected() {
        let relay = RelayCell::new(RelayCommand::Data, 1, vec![1]).unwrap();
        let mut payload = relay.encode().unwrap();
        // Force stream-id to zero on the wire
        payload[3] = 0;
        payload[4] = 0;
        assert!(RelayCell::decode(&payload).is_err());
    }

    #[test]
    fn test_relay_data_cap() {
        assert_eq!(RelayCell::MAX_DATA_SIZE, 498);
        assert!(RelayCell::new(RelayCommand::Data, 1, vec![0u8; 499]).is_err());
    }

    #[test]
    fn test_circuit_scoped_sendme_allows_zero_stream() {
        let relay = RelayCell::new(RelayCommand::Sendme, 0, vec![]).unwrap();
        let payload = relay.encode().unwrap();
        let parsed = RelayCell::decode(&payload).unwrap();
        assert_eq!(parsed.stream_id, 0);
    }
}
