//! Fixed-size wire header: magic tag, padding, payload type, and a
//! network-byte-order length field. See `message` for the in-memory record
//! that carries a header plus its payload while a message is in flight.

use byteorder::{BigEndian, ByteOrder};

/// Size of the wire header in octets: 5 (magic) + 2 (pad) + 1 (type) + 8 (length).
pub const HDR_SIZE: usize = 16;

/// Constant tag identifying a valid header.
pub const MAGIC: &[u8; 5] = b"DSmsg";

/// Offsets within the 16-octet header.
const TYPE_OFFSET: usize = 7;

/// Payload kind carried in the header's `type` octet. Only `Buffer` is
/// defined; any other value is rejected on receive (see `read_header`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Buffer = 0,
}

impl MessageType {
    fn from_u8(byte: u8) -> Option<MessageType> {
        match byte {
            0 => Some(MessageType::Buffer),
            _ => None,
        }
    }
}

/// A parsed header: the payload kind and length, in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub len: u64,
}

/// Why a received header could not be accepted. All variants are
/// protocol-fatal: they transition the receiving endpoint to ERRORED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("bad magic in message header")]
    BadMagic,
    #[error("unrecognized payload type {0}")]
    BadType(u8),
    #[error("payload length out of representable range")]
    LengthOutOfRange,
}

/// Writes a header for a `Buffer` payload of the given length. The pad
/// octets are left zero; they are reserved for future flags and ignored by
/// `read_header`.
pub fn write_header(len: u64) -> [u8; HDR_SIZE] {
    let mut hdr = [0u8; HDR_SIZE];
    hdr[0..5].copy_from_slice(MAGIC.as_slice());
    hdr[TYPE_OFFSET] = MessageType::Buffer as u8;
    BigEndian::write_u64(&mut hdr[8..16], len);
    hdr
}

/// Validates the magic tag, extracts the payload type, and converts the
/// length field from network to host byte order. Rejects any `type` other
/// than `Buffer` and any length that would not fit in a signed pointer
/// difference, per the wire format's invariants.
pub fn read_header(bytes: &[u8; HDR_SIZE]) -> Result<Header, HeaderError> {
    if &bytes[0..5] != MAGIC.as_slice() {
        return Err(HeaderError::BadMagic);
    }

    let msg_type =
        MessageType::from_u8(bytes[TYPE_OFFSET]).ok_or(HeaderError::BadType(bytes[TYPE_OFFSET]))?;

    let len = BigEndian::read_u64(&bytes[8..16]);
    if len > isize::MAX as u64 {
        return Err(HeaderError::LengthOutOfRange);
    }

    Ok(Header { msg_type, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_length_and_type() {
        let hdr = write_header(42);
        let parsed = read_header(&hdr).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Buffer);
        assert_eq!(parsed.len, 42);
    }

    #[test]
    fn zero_length_is_valid() {
        let hdr = write_header(0);
        let parsed = read_header(&hdr).unwrap();
        assert_eq!(parsed.len, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut hdr = write_header(5);
        hdr[0] = b'X';
        assert_eq!(read_header(&hdr), Err(HeaderError::BadMagic));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut hdr = write_header(5);
        hdr[TYPE_OFFSET] = 9;
        assert_eq!(read_header(&hdr), Err(HeaderError::BadType(9)));
    }

    #[test]
    fn rejects_length_outside_pointer_diff_range() {
        let mut hdr = [0u8; HDR_SIZE];
        hdr[0..5].copy_from_slice(MAGIC.as_slice());
        BigEndian::write_u64(&mut hdr[8..16], u64::MAX);
        assert_eq!(read_header(&hdr), Err(HeaderError::LengthOutOfRange));
    }

    #[test]
    fn pad_octets_are_ignored() {
        let mut hdr = write_header(7);
        hdr[5] = 0xff;
        hdr[6] = 0xff;
        let parsed = read_header(&hdr).unwrap();
        assert_eq!(parsed.len, 7);
    }
}
