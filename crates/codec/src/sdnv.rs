//! ## Self-Delimiting Numeric Values (SDNV)
//!
//! [RFC6256]: https://tools.ietf.org/html/rfc6256
//!
//! An SDNV encodes a non-negative integer as a sequence of bytes whose high
//! bit is set on every byte except the last; the low 7 bits of each byte,
//! concatenated in big-endian order, form the value. A 32-bit value occupies
//! at most 5 bytes, a 64-bit value at most 10.

use bytes::{BufMut, BytesMut};

use super::Error;

/// Longest legal encoding of a 64-bit value.
pub const MAX_LENGTH_U64: usize = 10;

/// Longest legal encoding of a 32-bit value.
pub const MAX_LENGTH_U32: usize = 5;

/// Number of bytes `encode_u64` will emit for `value`.
///
/// # Test
///
/// ```
/// use ltp_server_codec::sdnv::encoded_length_u64;
///
/// assert_eq!(encoded_length_u64(0), 1);
/// assert_eq!(encoded_length_u64(127), 1);
/// assert_eq!(encoded_length_u64(128), 2);
/// assert_eq!(encoded_length_u64(u64::MAX), 10);
/// ```
pub fn encoded_length_u64(value: u64) -> usize {
    let bits = (64 - value.leading_zeros()).max(1) as usize;
    bits.div_ceil(7)
}

/// Append the SDNV encoding of `value` to `bytes`.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use ltp_server_codec::sdnv::encode_u64;
///
/// let mut bytes = BytesMut::new();
/// encode_u64(0xABC, &mut bytes);
///
/// assert_eq!(&bytes[..], &[0x95, 0x3C]);
/// ```
pub fn encode_u64(value: u64, bytes: &mut BytesMut) -> usize {
    let length = encoded_length_u64(value);
    for i in (1..length).rev() {
        bytes.put_u8(0x80 | ((value >> (7 * i)) as u8 & 0x7F));
    }

    bytes.put_u8(value as u8 & 0x7F);
    length
}

/// Decode one SDNV from the front of `bytes`, returning the value and the
/// number of bytes consumed.
///
/// Fails if the buffer runs out before a terminating byte, if more than 10
/// bytes would be consumed, or if the decoded value would not fit in 64 bits.
///
/// # Test
///
/// ```
/// use ltp_server_codec::sdnv::decode_u64;
///
/// assert_eq!(decode_u64(&[0x95, 0x3C]).unwrap(), (0xABC, 2));
/// assert_eq!(decode_u64(&[0x00]).unwrap(), (0, 1));
/// assert!(decode_u64(&[0x80, 0x80]).is_err());
/// ```
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize), Error> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i == MAX_LENGTH_U64 {
            return Err(Error::SdnvTooLong);
        }

        if value >> 57 != 0 {
            return Err(Error::SdnvOverflow);
        }

        value = (value << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(Error::SdnvTruncated)
}

/// Decode one SDNV whose value must fit in 32 bits.
///
/// # Test
///
/// ```
/// use ltp_server_codec::sdnv::decode_u32;
///
/// assert_eq!(decode_u32(&[0x95, 0x3C]).unwrap(), (0xABC, 2));
/// assert!(decode_u32(&[0x90, 0x80, 0x80, 0x80, 0x00]).is_err());
/// ```
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize), Error> {
    let mut value: u32 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i == MAX_LENGTH_U32 {
            return Err(Error::SdnvTooLong);
        }

        if value >> 25 != 0 {
            return Err(Error::SdnvOverflow);
        }

        value = (value << 7) | (byte & 0x7F) as u32;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(Error::SdnvTruncated)
}

/// Decode consecutive SDNVs from `bytes` into `values`, returning how many
/// values were decoded and how many bytes were consumed.
///
/// A truncated trailing SDNV is not an error: decoding stops cleanly before
/// it so that the remaining bytes can be retried once more input arrives.
/// Malformed SDNVs (overlong or overflowing) still fail.
///
/// # Test
///
/// ```
/// use ltp_server_codec::sdnv::decode_many_u64;
///
/// let mut values = [0u64; 4];
///
/// // two complete values followed by a truncated third
/// let (decoded, consumed) = decode_many_u64(&[0x05, 0x95, 0x3C, 0x80], &mut values).unwrap();
///
/// assert_eq!(decoded, 2);
/// assert_eq!(consumed, 3);
/// assert_eq!(&values[..2], &[5, 0xABC]);
/// ```
pub fn decode_many_u64(bytes: &[u8], values: &mut [u64]) -> Result<(usize, usize), Error> {
    let mut consumed = 0;
    for (decoded, slot) in values.iter_mut().enumerate() {
        match decode_u64(&bytes[consumed..]) {
            Ok((value, size)) => {
                *slot = value;
                consumed += size;
            }
            Err(Error::SdnvTruncated) => return Ok((decoded, consumed)),
            Err(e) => return Err(e),
        }
    }

    Ok((values.len(), consumed))
}
