//! Versioned binary codec for persisted content records.
//!
//! All integers are big-endian. Layout (version 2):
//!
//! ```text
//! u32 version | u16-len key | u32 ctype-len, ctype | i64 expiry-millis (-1 = never)
//! | i64 last-modified-millis | u8 modifiable | [u16-len auth_key iff modifiable]
//! | u32 enc-len, enc | u32 content-len, content
//! ```
//!
//! Version 1 files omit the encoding block and are read as `gzip`. The
//! version word must be preserved for forward compatibility; readers
//! dispatch on it.

use bytes::Bytes;
use std::io::{self, Read, Write};

use super::Content;
use crate::encoding::GZIP;

/// The format version written by this build.
pub const VERSION: u32 = 2;

/// Serialize `content` to `out`.
pub fn write<W: Write>(content: &Content, out: &mut W) -> io::Result<()> {
    write_u32(out, VERSION)?;
    write_str16(out, &content.key)?;
    write_bytes32(out, content.content_type.as_bytes())?;
    write_i64(out, content.expiry.unwrap_or(-1))?;
    write_i64(out, content.last_modified)?;
    out.write_all(&[content.modifiable as u8])?;
    if content.modifiable {
        write_str16(out, content.auth_key.as_deref().unwrap_or_default())?;
    }
    write_bytes32(out, content.encoding.as_bytes())?;
    write_u32(out, content.content.len() as u32)?;
    out.write_all(&content.content)?;
    Ok(())
}

/// Deserialize a record from `input`.
///
/// With `skip_content`, everything but the final content block is read;
/// the returned record has empty bytes but a correct `content_length`.
/// Truncated input surfaces as `UnexpectedEof`, which callers treat as
/// corruption.
pub fn read<R: Read>(input: &mut R, skip_content: bool) -> io::Result<Content> {
    let version = read_u32(input)?;
    let key = read_str16(input)?;
    let content_type = read_string32(input)?;

    let expiry = match read_i64(input)? {
        -1 => None,
        millis => Some(millis),
    };
    let last_modified = read_i64(input)?;

    let modifiable = read_u8(input)? != 0;
    let auth_key = if modifiable {
        Some(read_str16(input)?)
    } else {
        None
    };

    let encoding = if version == 1 {
        GZIP.to_string()
    } else {
        read_string32(input)?
    };

    let content_length = read_u32(input)?;
    let bytes = if skip_content {
        Bytes::new()
    } else {
        let mut buf = vec![0u8; content_length as usize];
        input.read_exact(&mut buf)?;
        Bytes::from(buf)
    };

    let mut content = Content::new(
        key,
        content_type,
        expiry,
        last_modified,
        auth_key,
        encoding,
        bytes,
    );
    content.content_length = content_length as u64;
    Ok(content)
}

// -- Primitive helpers --------------------------------------------------------

fn write_u32<W: Write>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_all(&value.to_be_bytes())
}

fn write_i64<W: Write>(out: &mut W, value: i64) -> io::Result<()> {
    out.write_all(&value.to_be_bytes())
}

fn write_str16<W: Write>(out: &mut W, value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string too long for u16 length prefix",
        ));
    }
    out.write_all(&(bytes.len() as u16).to_be_bytes())?;
    out.write_all(bytes)
}

fn write_bytes32<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_u32(out, bytes.len() as u32)?;
    out.write_all(bytes)
}

fn read_u8<R: Read>(input: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64<R: Read>(input: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_str16<R: Read>(input: &mut R) -> io::Result<String> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    let mut bytes = vec![0u8; u16::from_be_bytes(buf) as usize];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 in record"))
}

fn read_string32<R: Read>(input: &mut R) -> io::Result<String> {
    let length = read_u32(input)?;
    let mut bytes = vec![0u8; length as usize];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 in record"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::now_millis;

    fn sample(auth_key: Option<String>, expiry: Option<i64>) -> Content {
        Content::new(
            "aZb9K42".to_string(),
            "application/json".to_string(),
            expiry,
            now_millis(),
            auth_key,
            "gzip".to_string(),
            Bytes::from_static(b"{\"hello\":\"world\"}"),
        )
    }

    #[test]
    fn test_roundtrip() {
        let content = sample(None, Some(now_millis() + 60_000));
        let mut buf = Vec::new();
        write(&content, &mut buf).unwrap();

        let decoded = read(&mut buf.as_slice(), false).unwrap();
        assert_eq!(decoded.key, content.key);
        assert_eq!(decoded.content_type, content.content_type);
        assert_eq!(decoded.expiry, content.expiry);
        assert_eq!(decoded.last_modified, content.last_modified);
        assert!(!decoded.modifiable);
        assert_eq!(decoded.auth_key, None);
        assert_eq!(decoded.encoding, "gzip");
        assert_eq!(decoded.content, content.content);
        assert_eq!(decoded.content_length, content.content.len() as u64);
    }

    #[test]
    fn test_roundtrip_modifiable() {
        let auth_key = "a".repeat(32);
        let content = sample(Some(auth_key.clone()), None);
        let mut buf = Vec::new();
        write(&content, &mut buf).unwrap();

        let decoded = read(&mut buf.as_slice(), false).unwrap();
        assert!(decoded.modifiable);
        assert_eq!(decoded.auth_key.as_deref(), Some(auth_key.as_str()));
        // -1 on the wire maps back to "never"
        assert_eq!(decoded.expiry, None);
    }

    #[test]
    fn test_skip_content_reads_length_only() {
        let content = sample(None, None);
        let mut buf = Vec::new();
        write(&content, &mut buf).unwrap();

        let decoded = read(&mut buf.as_slice(), true).unwrap();
        assert!(decoded.content.is_empty());
        assert_eq!(decoded.content_length, content.content.len() as u64);
    }

    #[test]
    fn test_version_1_implies_gzip() {
        // handcraft a version-1 record: no encoding block
        let mut buf = Vec::new();
        write_u32(&mut buf, 1).unwrap();
        write_str16(&mut buf, "oldkey1").unwrap();
        write_bytes32(&mut buf, b"text/plain").unwrap();
        write_i64(&mut buf, -1).unwrap();
        write_i64(&mut buf, 1234).unwrap();
        buf.push(0); // not modifiable
        write_bytes32(&mut buf, b"old bytes").unwrap();

        let decoded = read(&mut buf.as_slice(), false).unwrap();
        assert_eq!(decoded.key, "oldkey1");
        assert_eq!(decoded.encoding, "gzip");
        assert_eq!(decoded.content.as_ref(), b"old bytes");
    }

    #[test]
    fn test_truncated_record_is_eof() {
        let content = sample(None, None);
        let mut buf = Vec::new();
        write(&content, &mut buf).unwrap();
        buf.truncate(buf.len() - 4);

        let err = read(&mut buf.as_slice(), false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
