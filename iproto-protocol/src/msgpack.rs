//! Low-level MessagePack scanning over borrowed buffers.
//!
//! Responses are indexed without building a value tree: these helpers read
//! scalar headers in place and skip whole values by computing their encoded
//! length, so a body field can be handed out as a byte range.

use crate::error::ProtocolError;
use rmp::Marker;

fn need(buf: &[u8], pos: usize, n: usize) -> Result<(), ProtocolError> {
    if buf.len() < pos + n {
        return Err(ProtocolError::UnexpectedEof { offset: pos });
    }
    Ok(())
}

fn be_u16(buf: &[u8], pos: usize) -> Result<u16, ProtocolError> {
    need(buf, pos, 2)?;
    Ok(u16::from_be_bytes([buf[pos], buf[pos + 1]]))
}

fn be_u32(buf: &[u8], pos: usize) -> Result<u32, ProtocolError> {
    need(buf, pos, 4)?;
    Ok(u32::from_be_bytes([
        buf[pos],
        buf[pos + 1],
        buf[pos + 2],
        buf[pos + 3],
    ]))
}

fn be_u64(buf: &[u8], pos: usize) -> Result<u64, ProtocolError> {
    need(buf, pos, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[pos..pos + 8]);
    Ok(u64::from_be_bytes(raw))
}

fn marker_at(buf: &[u8], pos: usize) -> Result<Marker, ProtocolError> {
    need(buf, pos, 1)?;
    Ok(Marker::from_u8(buf[pos]))
}

/// Reads a frame length prefix from the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the length and
/// the number of prefix bytes consumed.
pub fn peek_length(buf: &[u8]) -> Result<Option<(u64, usize)>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let width = match Marker::from_u8(first) {
        Marker::FixPos(n) => return Ok(Some((n as u64, 1))),
        Marker::U8 => 1,
        Marker::U16 => 2,
        Marker::U32 => 4,
        Marker::U64 => 8,
        _ => return Err(ProtocolError::InvalidLength(first)),
    };
    if buf.len() < 1 + width {
        return Ok(None);
    }
    let len = match width {
        1 => buf[1] as u64,
        2 => be_u16(buf, 1)? as u64,
        4 => be_u32(buf, 1)? as u64,
        _ => be_u64(buf, 1)?,
    };
    Ok(Some((len, 1 + width)))
}

/// Reads a non-negative integer, returning the value and the next offset.
pub fn read_u64(buf: &[u8], pos: usize) -> Result<(u64, usize), ProtocolError> {
    let marker = marker_at(buf, pos)?;
    let p = pos + 1;
    let (value, end) = match marker {
        Marker::FixPos(n) => (n as u64, p),
        Marker::U8 | Marker::I8 => {
            need(buf, p, 1)?;
            let v = buf[p];
            if matches!(marker, Marker::I8) && (v as i8) < 0 {
                return Err(negative(pos));
            }
            (v as u64, p + 1)
        }
        Marker::U16 => (be_u16(buf, p)? as u64, p + 2),
        Marker::I16 => (non_negative(be_u16(buf, p)? as i16 as i64, pos)?, p + 2),
        Marker::U32 => (be_u32(buf, p)? as u64, p + 4),
        Marker::I32 => (non_negative(be_u32(buf, p)? as i32 as i64, pos)?, p + 4),
        Marker::U64 => (be_u64(buf, p)?, p + 8),
        Marker::I64 => (non_negative(be_u64(buf, p)? as i64, pos)?, p + 8),
        _ => {
            return Err(ProtocolError::MalformedMap {
                section: "value",
                reason: format!("expected unsigned integer at offset {pos}"),
            })
        }
    };
    Ok((value, end))
}

fn non_negative(v: i64, pos: usize) -> Result<u64, ProtocolError> {
    if v < 0 {
        return Err(negative(pos));
    }
    Ok(v as u64)
}

fn negative(pos: usize) -> ProtocolError {
    ProtocolError::MalformedMap {
        section: "value",
        reason: format!("negative integer at offset {pos}"),
    }
}

/// Reads a map header, returning the entry count and the next offset.
pub fn read_map_len(buf: &[u8], pos: usize) -> Result<(u32, usize), ProtocolError> {
    match marker_at(buf, pos)? {
        Marker::FixMap(n) => Ok((n as u32, pos + 1)),
        Marker::Map16 => Ok((be_u16(buf, pos + 1)? as u32, pos + 3)),
        Marker::Map32 => Ok((be_u32(buf, pos + 1)?, pos + 5)),
        _ => Err(ProtocolError::MalformedMap {
            section: "map",
            reason: format!("expected map at offset {pos}"),
        }),
    }
}

/// Reads an array header, returning the element count and the next offset.
pub fn read_array_len(buf: &[u8], pos: usize) -> Result<(u32, usize), ProtocolError> {
    match marker_at(buf, pos)? {
        Marker::FixArray(n) => Ok((n as u32, pos + 1)),
        Marker::Array16 => Ok((be_u16(buf, pos + 1)? as u32, pos + 3)),
        Marker::Array32 => Ok((be_u32(buf, pos + 1)?, pos + 5)),
        _ => Err(ProtocolError::MalformedMap {
            section: "array",
            reason: format!("expected array at offset {pos}"),
        }),
    }
}

/// Returns the offset just past the value starting at `pos`.
///
/// Containers are walked iteratively, so deeply nested input cannot
/// exhaust the stack.
pub fn skip_value(buf: &[u8], pos: usize) -> Result<usize, ProtocolError> {
    let mut pos = pos;
    let mut remaining: u64 = 1;

    while remaining > 0 {
        remaining -= 1;
        let marker = marker_at(buf, pos)?;
        pos += 1;
        let payload = match marker {
            Marker::FixPos(_)
            | Marker::FixNeg(_)
            | Marker::Null
            | Marker::True
            | Marker::False => 0,
            Marker::U8 | Marker::I8 => 1,
            Marker::U16 | Marker::I16 => 2,
            Marker::U32 | Marker::I32 | Marker::F32 => 4,
            Marker::U64 | Marker::I64 | Marker::F64 => 8,
            Marker::FixStr(n) => n as usize,
            Marker::Str8 | Marker::Bin8 => {
                need(buf, pos, 1)?;
                let n = buf[pos] as usize;
                pos += 1;
                n
            }
            Marker::Str16 | Marker::Bin16 => {
                let n = be_u16(buf, pos)? as usize;
                pos += 2;
                n
            }
            Marker::Str32 | Marker::Bin32 => {
                let n = be_u32(buf, pos)? as usize;
                pos += 4;
                n
            }
            Marker::FixArray(n) => {
                remaining += n as u64;
                0
            }
            Marker::Array16 => {
                remaining += be_u16(buf, pos)? as u64;
                pos += 2;
                0
            }
            Marker::Array32 => {
                remaining += be_u32(buf, pos)? as u64;
                pos += 4;
                0
            }
            Marker::FixMap(n) => {
                remaining += 2 * n as u64;
                0
            }
            Marker::Map16 => {
                remaining += 2 * be_u16(buf, pos)? as u64;
                pos += 2;
                0
            }
            Marker::Map32 => {
                remaining += 2 * be_u32(buf, pos)? as u64;
                pos += 4;
                0
            }
            Marker::FixExt1 => 2,
            Marker::FixExt2 => 3,
            Marker::FixExt4 => 5,
            Marker::FixExt8 => 9,
            Marker::FixExt16 => 17,
            Marker::Ext8 => {
                need(buf, pos, 1)?;
                let n = buf[pos] as usize;
                pos += 1;
                n + 1
            }
            Marker::Ext16 => {
                let n = be_u16(buf, pos)? as usize;
                pos += 2;
                n + 1
            }
            Marker::Ext32 => {
                let n = be_u32(buf, pos)? as usize;
                pos += 4;
                n + 1
            }
            Marker::Reserved => {
                return Err(ProtocolError::InvalidMarker {
                    marker: buf[pos - 1],
                    offset: pos - 1,
                })
            }
        };
        need(buf, pos, payload)?;
        pos += payload;
    }

    Ok(pos)
}

/// Scans a map whose keys are small unsigned integers.
///
/// Returns `(key, value_start, value_end)` for every entry and the offset
/// just past the map.
pub fn index_int_map(
    buf: &[u8],
    pos: usize,
    section: &'static str,
) -> Result<(Vec<(u8, usize, usize)>, usize), ProtocolError> {
    let (len, mut pos) = read_map_len(buf, pos).map_err(|e| match e {
        ProtocolError::MalformedMap { .. } => ProtocolError::MalformedMap {
            section,
            reason: "not a map".to_string(),
        },
        other => other,
    })?;
    // every entry takes at least two bytes, so a forged count cannot
    // reserve more than the buffer could hold
    let room = buf.len().saturating_sub(pos) / 2;
    let mut entries = Vec::with_capacity((len as usize).min(room));
    for _ in 0..len {
        let (key, value_start) = read_u64(buf, pos).map_err(|_| ProtocolError::MalformedMap {
            section,
            reason: format!("non-integer key at offset {pos}"),
        })?;
        let key = u8::try_from(key).map_err(|_| ProtocolError::MalformedMap {
            section,
            reason: format!("key {key} out of range"),
        })?;
        let value_end = skip_value(buf, value_start)?;
        entries.push((key, value_start, value_end));
        pos = value_end;
    }
    Ok((entries, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).unwrap();
        buf
    }

    #[test]
    fn test_peek_length_variants() {
        assert_eq!(peek_length(&[0x05]).unwrap(), Some((5, 1)));
        assert_eq!(peek_length(&[0xcc, 0xff]).unwrap(), Some((255, 2)));
        assert_eq!(
            peek_length(&[0xce, 0x00, 0x01, 0x00, 0x00]).unwrap(),
            Some((65536, 5))
        );
        assert_eq!(peek_length(&[]).unwrap(), None);
        assert_eq!(peek_length(&[0xce, 0x00]).unwrap(), None);
    }

    #[test]
    fn test_peek_length_rejects_non_uint() {
        assert!(matches!(
            peek_length(&[0xa3]),
            Err(ProtocolError::InvalidLength(0xa3))
        ));
        assert!(matches!(
            peek_length(&[0xd0, 0x01]),
            Err(ProtocolError::InvalidLength(0xd0))
        ));
    }

    #[test]
    fn test_skip_nested_value() {
        let value = Value::Array(vec![
            Value::from(1),
            Value::Map(vec![(Value::from("a"), Value::Binary(vec![1, 2, 3]))]),
            Value::from(-70000),
            Value::F64(1.5),
            Value::Ext(1, vec![0; 5]),
        ]);
        let mut buf = encode(&value);
        let len = buf.len();
        buf.extend_from_slice(&[0xc0]);
        assert_eq!(skip_value(&buf, 0).unwrap(), len);
    }

    #[test]
    fn test_skip_truncated() {
        let buf = encode(&Value::from("hello world"));
        let result = skip_value(&buf[..buf.len() - 2], 0);
        assert!(matches!(result, Err(ProtocolError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_skip_reserved_marker() {
        let result = skip_value(&[0xc1], 0);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidMarker { marker: 0xc1, .. })
        ));
    }

    #[test]
    fn test_read_u64_accepts_non_negative_signed() {
        assert_eq!(read_u64(&[0xd0, 0x07], 0).unwrap(), (7, 2));
        assert!(read_u64(&[0xd0, 0xff], 0).is_err());
        assert!(read_u64(&[0xa1, b'x'], 0).is_err());
    }

    #[test]
    fn test_index_int_map() {
        let value = Value::Map(vec![
            (Value::from(0x30), Value::Array(vec![Value::from(1)])),
            (Value::from(0x10), Value::from(512)),
        ]);
        let buf = encode(&value);
        let (entries, end) = index_int_map(&buf, 0, "body").unwrap();
        assert_eq!(end, buf.len());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 0x30);
        assert_eq!(&buf[entries[0].1..entries[0].2], &[0x91, 0x01]);
        assert_eq!(entries[1].0, 0x10);
    }

    #[test]
    fn test_index_int_map_string_key() {
        let value = Value::Map(vec![(Value::from("k"), Value::from(1))]);
        let buf = encode(&value);
        let result = index_int_map(&buf, 0, "body");
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedMap {
                section: "body",
                ..
            })
        ));
    }

    #[test]
    fn test_index_int_map_huge_count() {
        let buf = [0xdf, 0xff, 0xff, 0xff, 0xff, 0x00, 0x01];
        let result = index_int_map(&buf, 0, "header");
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedEof { .. }) | Err(ProtocolError::MalformedMap { .. })
        ));
    }
}
