//! TFTP wire format
//!
//! Packet layouts from RFC 1350 plus the option extension of RFC 2347.
//! The client handler builds requests and reads replies with these helpers;
//! the server handler does the reverse.
//!
//! ```text
//! RRQ/WRQ | 01/02 | filename | 0 | mode | 0 | [opt | 0 | value | 0]* |
//! DATA    | 03    | block    | payload                               |
//! ACK     | 04    | block    |                                       |
//! ERROR   | 05    | code     | message | 0                           |
//! OACK    | 06    | [opt | 0 | value | 0]*                           |
//! ```

use std::collections::HashMap;
use std::fmt;

use anyhow::{Result, anyhow, bail};

/// Packet type, the first two bytes of every datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Acknowledgment = 4,
    Error = 5,
    OptionAck = 6,
}

impl TftpOpcode {
    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ERROR packet codes (RFC 1350, code 8 from RFC 2347)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl TftpErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Message sent when nothing more specific is known
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }

    /// Codes outside 0..=8 fold into `NotDefined`
    fn from_wire(code: u16) -> Self {
        match code {
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            8 => Self::OptionNegotiationFailed,
            _ => Self::NotDefined,
        }
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Request mode. Only `octet` is served; `netascii` is recognised so it can
/// be refused with a proper error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    Octet,
    NetAscii,
}

impl TransferMode {
    /// Mode names are case-insensitive on the wire
    pub fn from_wire(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("octet") {
            Some(Self::Octet)
        } else if name.eq_ignore_ascii_case("netascii") {
            Some(Self::NetAscii)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    pub fn is_supported(self) -> bool {
        self == Self::Octet
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Option names understood by the engine
pub mod options {
    /// RFC 2348
    pub const BLKSIZE: &str = "blksize";
    /// RFC 2349
    pub const TSIZE: &str = "tsize";
    /// RFC 2349
    pub const TIMEOUT: &str = "timeout";
    /// RFC 7440; only a window of 1 is ever answered
    pub const WINDOWSIZE: &str = "windowsize";
}

/// 4 header bytes plus the largest block RFC 2348 allows
pub const MAX_PACKET_SIZE: usize = 4 + 65464;

/// Block size limits (RFC 2348)
pub struct BlockSize;

impl BlockSize {
    pub const DEFAULT: usize = 512;
    pub const MIN: usize = 8;
    /// Keeps a DATA packet inside a 1500-byte Ethernet MTU
    pub const MAX: usize = 1400;

    /// Block size to use for a proposed `blksize`, capped at `ceiling`.
    /// `None` when the proposal is not a number or is below [`Self::MIN`].
    pub fn negotiate(proposed: &str, ceiling: usize) -> Option<usize> {
        let size = proposed.parse::<usize>().ok().filter(|&n| n >= Self::MIN)?;
        Some(size.min(ceiling.max(Self::MIN)))
    }
}

/// A decoded RRQ or WRQ
#[derive(Debug, Clone, PartialEq)]
pub struct TftpRequest {
    pub opcode: TftpOpcode,
    pub filename: String,
    pub mode: TransferMode,
    /// Option names are lowercased
    pub options: HashMap<String, String>,
}

impl TftpRequest {
    pub fn read_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            opcode: TftpOpcode::ReadRequest,
            filename: filename.into(),
            mode,
            options: HashMap::new(),
        }
    }

    pub fn write_request(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            opcode: TftpOpcode::WriteRequest,
            ..Self::read_request(filename, mode)
        }
    }

    pub fn with_option(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = header(self.opcode);
        push_str(&mut packet, &self.filename);
        push_str(&mut packet, self.mode.as_str());
        push_options(&mut packet, &self.options);
        packet
    }
}

/// An ERROR packet's content.
///
/// Travels inside [`anyhow::Error`] when the peer aborts a transfer;
/// `downcast_ref::<TftpError>()` recovers the code and message.
#[derive(Debug, Clone, PartialEq)]
pub struct TftpError {
    pub code: TftpErrorCode,
    pub message: String,
}

impl TftpError {
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Closest TFTP code for a local I/O failure
    ///
    /// ```
    /// use std::io;
    /// use tftp::{TftpError, TftpErrorCode};
    ///
    /// let err = io::Error::from(io::ErrorKind::NotFound);
    /// assert_eq!(TftpError::from_io(&err).code, TftpErrorCode::FileNotFound);
    /// ```
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => TftpErrorCode::FileNotFound,
            ErrorKind::PermissionDenied => TftpErrorCode::AccessViolation,
            ErrorKind::AlreadyExists => TftpErrorCode::FileAlreadyExists,
            ErrorKind::StorageFull => TftpErrorCode::DiskFull,
            _ => TftpErrorCode::NotDefined,
        };
        Self::with_default_message(code)
    }

    /// Code as sent on the wire
    pub fn raw_code(&self) -> u16 {
        self.code.as_u16()
    }

    pub fn to_packet(&self) -> Vec<u8> {
        build_error(self.raw_code(), &self.message)
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TftpError {}

/// Reader over the NUL-terminated strings that follow the opcode
struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(packet: &'a [u8]) -> Self {
        Self {
            rest: packet.get(2..).unwrap_or_default(),
        }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn next_str(&mut self, what: &str) -> Result<&'a str> {
        let rest = self.rest;
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow!("{} not terminated", what))?;
        let field = std::str::from_utf8(&rest[..end]).map_err(|_| anyhow!("{} is not UTF-8", what))?;
        self.rest = &rest[end + 1..];
        Ok(field)
    }

    /// Option pairs up to the end of the packet. A trailing name without a
    /// value is dropped; some clients pad their requests.
    fn options(mut self) -> Result<HashMap<String, String>> {
        let mut options = HashMap::new();
        while !self.is_empty() {
            let name = self.next_str("option name")?.to_ascii_lowercase();
            if self.is_empty() {
                break;
            }
            let value = self.next_str("option value")?;
            options.insert(name, value.to_string());
        }
        Ok(options)
    }
}

fn header(opcode: TftpOpcode) -> Vec<u8> {
    opcode.as_u16().to_be_bytes().to_vec()
}

fn push_str(packet: &mut Vec<u8>, value: &str) {
    packet.extend_from_slice(value.as_bytes());
    packet.push(0);
}

fn push_options(packet: &mut Vec<u8>, options: &HashMap<String, String>) {
    for (name, value) in options {
        push_str(packet, name);
        push_str(packet, value);
    }
}

/// Opcode and the 16-bit word after it, for fixed-layout packets
fn fixed_header(packet: &[u8], expected: TftpOpcode) -> Result<u16> {
    if packet.len() < 4 {
        bail!("{} packet too short ({} bytes)", expected, packet.len());
    }
    if get_tftp_opcode(packet) != Some(expected) {
        bail!("not a {} packet", expected);
    }
    Ok(u16::from_be_bytes([packet[2], packet[3]]))
}

/// Decode an RRQ or WRQ. Unknown modes are an error; `netascii` decodes and
/// is left for the caller to refuse.
pub fn parse_request(packet: &[u8]) -> Result<TftpRequest> {
    let opcode = match get_tftp_opcode(packet) {
        Some(opcode @ (TftpOpcode::ReadRequest | TftpOpcode::WriteRequest)) => opcode,
        _ => bail!("not a request packet"),
    };

    let mut fields = Fields::new(packet);
    let filename = fields.next_str("filename")?;
    if filename.is_empty() {
        bail!("empty filename");
    }
    let mode = fields.next_str("mode")?;
    let mode = TransferMode::from_wire(mode).ok_or_else(|| anyhow!("unknown transfer mode '{}'", mode))?;

    Ok(TftpRequest {
        opcode,
        filename: filename.to_string(),
        mode,
        options: fields.options()?,
    })
}

/// Block number and payload of a DATA packet
pub fn parse_data(packet: &[u8]) -> Result<(u16, &[u8])> {
    let block = fixed_header(packet, TftpOpcode::Data)?;
    Ok((block, &packet[4..]))
}

/// Block number of an ACK packet
pub fn parse_ack(packet: &[u8]) -> Result<u16> {
    fixed_header(packet, TftpOpcode::Acknowledgment)
}

pub fn parse_oack(packet: &[u8]) -> Result<HashMap<String, String>> {
    if get_tftp_opcode(packet) != Some(TftpOpcode::OptionAck) {
        bail!("not an OACK packet");
    }
    Fields::new(packet).options()
}

/// Decode an ERROR packet. The message ends at the first NUL or at the end
/// of the packet, and invalid UTF-8 is replaced rather than rejected.
pub fn parse_tftp_error(packet: &[u8]) -> Result<TftpError> {
    let code = fixed_header(packet, TftpOpcode::Error)?;
    let text = &packet[4..];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Ok(TftpError::new(
        TftpErrorCode::from_wire(code),
        String::from_utf8_lossy(&text[..end]),
    ))
}

pub fn build_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = header(TftpOpcode::Data);
    packet.extend_from_slice(&block.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

pub fn build_ack(block: u16) -> Vec<u8> {
    let mut packet = header(TftpOpcode::Acknowledgment);
    packet.extend_from_slice(&block.to_be_bytes());
    packet
}

pub fn build_error(code: u16, message: &str) -> Vec<u8> {
    let mut packet = header(TftpOpcode::Error);
    packet.extend_from_slice(&code.to_be_bytes());
    push_str(&mut packet, message);
    packet
}

pub fn build_oack(options: &HashMap<String, String>) -> Vec<u8> {
    let mut packet = header(TftpOpcode::OptionAck);
    push_options(&mut packet, options);
    packet
}

/// Opcode of a datagram, if it has a known one
pub fn get_tftp_opcode(packet: &[u8]) -> Option<TftpOpcode> {
    TftpOpcode::from_wire(u16::from_be_bytes([*packet.first()?, *packet.get(1)?]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_request(opcode: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0, opcode];
        packet.extend_from_slice(body);
        packet
    }

    #[test]
    fn test_opcode_from_wire() {
        assert_eq!(TftpOpcode::from_wire(2), Some(TftpOpcode::WriteRequest));
        assert_eq!(TftpOpcode::from_wire(99), None);
        assert_eq!(get_tftp_opcode(&build_ack(5)), Some(TftpOpcode::Acknowledgment));
        assert_eq!(get_tftp_opcode(&[0]), None);
        assert_eq!(get_tftp_opcode(&[0, 9]), None);
    }

    #[test]
    fn test_transfer_mode_names() {
        assert_eq!(TransferMode::from_wire("OcTeT"), Some(TransferMode::Octet));
        assert_eq!(TransferMode::from_wire("netascii"), Some(TransferMode::NetAscii));
        assert_eq!(TransferMode::from_wire("mail"), None);
        assert!(!TransferMode::NetAscii.is_supported());
    }

    #[test]
    fn test_block_size_negotiation() {
        assert_eq!(BlockSize::negotiate("1024", BlockSize::MAX), Some(1024));
        assert_eq!(BlockSize::negotiate("65464", BlockSize::MAX), Some(1400));
        assert_eq!(BlockSize::negotiate("8", BlockSize::MAX), Some(8));
        assert_eq!(BlockSize::negotiate("7", BlockSize::MAX), None);
        assert_eq!(BlockSize::negotiate("lots", BlockSize::MAX), None);
        // A ceiling below the protocol minimum still allows the minimum
        assert_eq!(BlockSize::negotiate("512", 0), Some(8));
    }

    #[test]
    fn test_write_request_encodes_options() {
        let mut request = TftpRequest::write_request("upload.bin", TransferMode::Octet);
        request.with_option("BLKSIZE", "1024").with_option("tsize", "4096");

        let parsed = parse_request(&request.to_packet()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.options.get("blksize").map(String::as_str), Some("1024"));
    }

    #[test]
    fn test_parse_request_from_wire_bytes() {
        let packet = raw_request(1, b"boot.img\0OCTET\0BlkSize\x001400\0tsize\x000\0dangling\0");

        let request = parse_request(&packet).unwrap();
        assert_eq!(request.opcode, TftpOpcode::ReadRequest);
        assert_eq!(request.filename, "boot.img");
        assert_eq!(request.mode, TransferMode::Octet);
        assert_eq!(request.options.len(), 2);
        assert_eq!(request.options.get("blksize").map(String::as_str), Some("1400"));
    }

    #[test]
    fn test_parse_request_rejects_bad_packets() {
        assert!(parse_request(&build_ack(1)).is_err());
        assert!(parse_request(&[0, 1]).is_err());
        assert!(parse_request(&raw_request(1, b"file")).is_err());
        assert!(parse_request(&raw_request(2, b"file\0mail\0")).is_err());
        assert!(parse_request(&raw_request(1, b"\0octet\0")).is_err());
        assert!(parse_request(&raw_request(1, b"file\0octet\0blksize\x00512")).is_err());
    }

    #[test]
    fn test_data_and_ack() {
        let packet = build_data(7, b"payload");
        assert_eq!(parse_data(&packet).unwrap(), (7, &b"payload"[..]));
        assert_eq!(parse_data(&build_data(1, &[])).unwrap().1.len(), 0);
        assert!(parse_data(&build_ack(7)).is_err());

        let ack = build_ack(42);
        assert_eq!(ack, [0, 4, 0, 42]);
        assert_eq!(parse_ack(&ack).unwrap(), 42);
        assert!(parse_ack(&[0, 4, 0]).is_err());
    }

    #[test]
    fn test_error_packets() {
        let packet = TftpError::new(TftpErrorCode::NotDefined, "RETRY LATER").to_packet();
        assert_eq!(&packet[..4], [0, 5, 0, 0]);
        assert_eq!(packet.last(), Some(&0));

        let error = parse_tftp_error(&packet).unwrap();
        assert_eq!(error, TftpError::new(TftpErrorCode::NotDefined, "RETRY LATER"));

        // Unknown codes fold into NotDefined; a missing terminator is tolerated
        let error = parse_tftp_error(&[0, 5, 0, 42, b'h', b'i']).unwrap();
        assert_eq!(error.code, TftpErrorCode::NotDefined);
        assert_eq!(error.message, "hi");
    }

    #[test]
    fn test_oack_parses_back() {
        let mut options = HashMap::new();
        options.insert("blksize".to_string(), "1400".to_string());
        options.insert("tsize".to_string(), "1024".to_string());

        assert_eq!(parse_oack(&build_oack(&options)).unwrap(), options);
        assert!(parse_oack(&build_ack(0)).is_err());
    }

    #[test]
    fn test_error_from_io() {
        use std::io::{Error, ErrorKind};

        let code = |kind: ErrorKind| TftpError::from_io(&Error::from(kind)).code;
        assert_eq!(code(ErrorKind::PermissionDenied), TftpErrorCode::AccessViolation);
        assert_eq!(code(ErrorKind::AlreadyExists), TftpErrorCode::FileAlreadyExists);
        assert_eq!(code(ErrorKind::StorageFull), TftpErrorCode::DiskFull);
        assert_eq!(TftpError::from_io(&Error::other("boom")).code, TftpErrorCode::NotDefined);
    }
}
