//! Wire codec: validation and classification of inbound datagrams, and encoding of outbound
//!  packets. This is the only module that touches network byte order or the checksum - all
//!  other modules work on decoded, host-order values.

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;

use crate::safe_converter::PrecheckedCast;

/// length + checksum + ack number
pub const ACK_PACKET_LEN: usize = 8;
/// length + checksum + sequence number + ack number
pub const DATA_HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD_LEN: usize = 500;
pub const MAX_PACKET_LEN: usize = DATA_HEADER_LEN + MAX_PAYLOAD_LEN;

const CHECKSUM_OFFSET: usize = 2;

/// The checksum is an opaque 16-bit primitive as far as the protocol is concerned - any
///  collision-resistant-enough error detection code works, as long as both peers agree.
const CHECKSUM: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

/// A validated, decoded inbound packet. Payloads borrow from the receive buffer - nothing is
///  copied until the receive window decides to keep a packet.
#[derive(Debug, PartialEq, Eq)]
pub enum RawPacket<'a> {
    Ack {
        ack_number: u32,
    },
    Data {
        sequence_number: u32,
        ack_number: u32,
        /// empty payload means this packet is the EOF marker
        payload: &'a [u8],
    },
}

/// Why an inbound buffer failed validation. These are expected wire noise, not errors: the
///  caller logs and discards.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketDefect {
    /// fewer bytes than an ack packet, more than a maximum data packet, or in the dead zone
    ///  between ack length and data header length
    InvalidSize(usize),
    /// the declared length field is zero, not a valid ack / data packet length, or exceeds
    ///  the bytes actually received
    InvalidLengthField { declared: usize, received: usize },
    ChecksumMismatch { declared: u16, computed: u16 },
}

/// Validate and classify an inbound datagram.
///
/// The checksum is computed over exactly the *declared* length with the checksum field zeroed;
///  trailing bytes beyond the declared length are tolerated and not covered.
pub fn parse(datagram: &[u8]) -> Result<RawPacket<'_>, PacketDefect> {
    let received = datagram.len();
    if received < ACK_PACKET_LEN
        || received > MAX_PACKET_LEN
        || (received > ACK_PACKET_LEN && received < DATA_HEADER_LEN)
    {
        return Err(PacketDefect::InvalidSize(received));
    }

    let mut header = &datagram[..];
    let declared = header.try_get_u16()
        .expect("size was checked above") as usize;
    let declared_checksum = header.try_get_u16()
        .expect("size was checked above");

    let valid_data_len = (DATA_HEADER_LEN..=MAX_PACKET_LEN).contains(&declared);
    if declared > received || !(declared == ACK_PACKET_LEN || valid_data_len) {
        return Err(PacketDefect::InvalidLengthField { declared, received });
    }

    let computed = checksum_with_zeroed_field(&datagram[..declared]);
    if computed != declared_checksum {
        return Err(PacketDefect::ChecksumMismatch { declared: declared_checksum, computed });
    }

    if declared == ACK_PACKET_LEN {
        let ack_number = header.try_get_u32()
            .expect("size was checked above");
        Ok(RawPacket::Ack { ack_number })
    }
    else {
        let sequence_number = header.try_get_u32()
            .expect("size was checked above");
        let ack_number = header.try_get_u32()
            .expect("size was checked above");
        Ok(RawPacket::Data {
            sequence_number,
            ack_number,
            payload: &datagram[DATA_HEADER_LEN..declared],
        })
    }
}

/// Encode a data packet (or the EOF marker, for an empty payload), checksummed and ready for
///  the wire. A payload above the per-packet maximum is an error rather than a panic - it can
///  only come from a misbehaving data source, which is fatal to the session but not to the
///  process.
pub fn encode_data(sequence_number: u32, ack_number: u32, payload: &[u8]) -> anyhow::Result<BytesMut> {
    if payload.len() > MAX_PAYLOAD_LEN {
        bail!("payload of {} bytes exceeds the per-packet maximum of {}", payload.len(), MAX_PAYLOAD_LEN);
    }

    let len = DATA_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u16(len.prechecked_cast());
    buf.put_u16(0);
    buf.put_u32(sequence_number);
    buf.put_u32(ack_number);
    buf.put_slice(payload);

    finalize_checksum(&mut buf);
    Ok(buf)
}

/// Encode an ack-only packet, checksummed and ready for the wire.
pub fn encode_ack(ack_number: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ACK_PACKET_LEN);
    buf.put_u16(ACK_PACKET_LEN.prechecked_cast());
    buf.put_u16(0);
    buf.put_u32(ack_number);

    finalize_checksum(&mut buf);
    buf
}

fn finalize_checksum(buf: &mut [u8]) {
    let checksum = checksum_with_zeroed_field(buf);
    buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
}

fn checksum_with_zeroed_field(buf: &[u8]) -> u16 {
    let mut digest = CHECKSUM.digest();
    digest.update(&buf[..CHECKSUM_OFFSET]);
    digest.update(&[0, 0]);
    digest.update(&buf[CHECKSUM_OFFSET + 2..]);
    digest.finalize()
}
