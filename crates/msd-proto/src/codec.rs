// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Primitive field encoding.
//!
//! Every read is exact: running out of bytes mid-field yields
//! [`ProtoError::Eof`], never a partial value.

use std::io::{Read, Write};

use crate::ProtoError;

/// Largest `data` payload. Lengths stay within the signed 16-bit range.
pub const MAX_DATA_LEN: usize = 0x7fff;

/// Largest collection, bounded by the u8 count prefix.
pub const MAX_ITEMS: usize = u8::MAX as usize;

pub fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8, ProtoError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_u8<W: Write + ?Sized>(writer: &mut W, value: u8) -> Result<(), ProtoError> {
    writer.write_all(&[value])?;
    Ok(())
}

pub fn read_u16<R: Read + ?Sized>(reader: &mut R) -> Result<u16, ProtoError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_bool<R: Read + ?Sized>(reader: &mut R) -> Result<bool, ProtoError> {
    match read_u8(reader)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtoError::InvalidBool(other)),
    }
}

pub fn write_bool<W: Write + ?Sized>(writer: &mut W, value: bool) -> Result<(), ProtoError> {
    write_u8(writer, u8::from(value))
}

pub fn read_data<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>, ProtoError> {
    let len = usize::from(read_u16(reader)?);
    if len > MAX_DATA_LEN {
        return Err(ProtoError::OversizedField {
            len,
            max: MAX_DATA_LEN,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Callers must have checked the length with [`check_data_len`] first so that
/// an oversized buffer is rejected before any byte reaches the stream.
pub fn write_data<W: Write + ?Sized>(writer: &mut W, data: &[u8]) -> Result<(), ProtoError> {
    check_data_len(data)?;
    // Lossless after the bound check.
    let len = data.len() as u16;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

pub fn read_text<R: Read + ?Sized>(reader: &mut R) -> Result<String, ProtoError> {
    String::from_utf8(read_data(reader)?).map_err(|_| ProtoError::InvalidUtf8)
}

pub fn check_data_len(data: &[u8]) -> Result<(), ProtoError> {
    if data.len() > MAX_DATA_LEN {
        return Err(ProtoError::DataTooLong {
            len: data.len(),
            max: MAX_DATA_LEN,
        });
    }
    Ok(())
}

pub fn check_item_count(len: usize) -> Result<u8, ProtoError> {
    u8::try_from(len).map_err(|_| ProtoError::TooManyItems {
        len,
        max: MAX_ITEMS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[msd_test_utils::logged_test]
    fn data_is_length_prefixed_little_endian() {
        let mut buf = Vec::new();
        write_data(&mut buf, b"lun").unwrap();
        assert_eq!(buf, [3, 0, b'l', b'u', b'n']);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_data(&mut cursor).unwrap(), b"lun");
    }

    #[msd_test_utils::logged_test]
    fn maximum_length_data_round_trips() {
        let payload = vec![0xa5; MAX_DATA_LEN];
        let mut buf = Vec::new();
        write_data(&mut buf, &payload).unwrap();
        assert_eq!(&buf[..2], &[0xff, 0x7f]);

        let decoded = read_data(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.len(), MAX_DATA_LEN);
    }

    #[msd_test_utils::logged_test]
    fn oversized_data_is_rejected_before_writing() {
        let payload = vec![0u8; MAX_DATA_LEN + 1];
        let mut buf = Vec::new();
        let err = write_data(&mut buf, &payload).unwrap_err();
        assert!(matches!(err, ProtoError::DataTooLong { len, .. } if len == MAX_DATA_LEN + 1));
        assert!(buf.is_empty());
    }

    #[msd_test_utils::logged_test]
    fn oversized_length_prefix_is_malformed() {
        let mut cursor = Cursor::new(vec![0xff, 0xff]);
        assert!(matches!(
            read_data(&mut cursor),
            Err(ProtoError::OversizedField { len: 0xffff, .. })
        ));
    }

    #[msd_test_utils::logged_test]
    fn truncated_fields_are_eof() {
        assert!(read_u8(&mut Cursor::new(Vec::new())).unwrap_err().is_eof());
        assert!(read_u16(&mut Cursor::new(vec![1])).unwrap_err().is_eof());
        assert!(read_data(&mut Cursor::new(vec![4, 0, b'a'])).unwrap_err().is_eof());
    }

    #[msd_test_utils::logged_test]
    fn booleans_are_strict() {
        assert!(!read_bool(&mut Cursor::new(vec![0])).unwrap());
        assert!(read_bool(&mut Cursor::new(vec![1])).unwrap());
        assert!(matches!(
            read_bool(&mut Cursor::new(vec![2])),
            Err(ProtoError::InvalidBool(2))
        ));
    }

    #[msd_test_utils::logged_test]
    fn text_requires_utf8() {
        let mut buf = Vec::new();
        write_data(&mut buf, &[0xff, 0xfe]).unwrap();
        assert!(matches!(
            read_text(&mut Cursor::new(buf)),
            Err(ProtoError::InvalidUtf8)
        ));
    }

    #[msd_test_utils::logged_test]
    fn item_count_is_bounded() {
        assert_eq!(check_item_count(255).unwrap(), 255);
        assert!(matches!(
            check_item_count(256),
            Err(ProtoError::TooManyItems { len: 256, max: 255 })
        ));
    }
}
