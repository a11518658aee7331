use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::consts;
use crate::error::{truncated, CabError, Result};

/// Reads bytes up to (and consuming) the NUL terminator.  The caller picks
/// the decoding: names carry a UTF-8 attribute bit, everything else in the
/// format is ASCII.  Bytes above 0x7f in a non-UTF-8 string decode as
/// Latin-1, so well-formed ASCII input round-trips unchanged.
pub(crate) fn read_null_terminated_string<R: Read>(
    reader: &mut R,
    is_utf8: bool,
) -> Result<String> {
    let mut bytes = Vec::<u8>::with_capacity(consts::MAX_STRING_SIZE);
    loop {
        let byte = reader.read_u8().map_err(|e| truncated(e, "string"))?;
        if byte == 0 {
            break;
        } else if bytes.len() == consts::MAX_STRING_SIZE {
            return Err(CabError::NameTooLong {
                name: String::from_utf8_lossy(&bytes).into_owned(),
                length: bytes.len() + 1,
            });
        }
        bytes.push(byte);
    }
    if is_utf8 {
        match String::from_utf8(bytes) {
            Ok(string) => Ok(string),
            Err(err) => Err(CabError::unsupported(format!(
                "invalid UTF-8 in string: {}",
                err
            ))),
        }
    } else {
        Ok(bytes.iter().map(|&byte| char::from(byte)).collect())
    }
}

/// Emits the string's bytes followed by a NUL terminator.
pub(crate) fn write_null_terminated_string<W: Write>(
    writer: &mut W,
    string: &str,
) -> Result<()> {
    if string.len() > consts::MAX_STRING_SIZE {
        return Err(CabError::NameTooLong {
            name: string.to_string(),
            length: string.len(),
        });
    }
    writer.write_all(string.as_bytes())?;
    writer.write_u8(0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{read_null_terminated_string, write_null_terminated_string};
    use crate::error::CabError;

    #[test]
    fn ascii_string_roundtrip() {
        let mut output = Vec::new();
        write_null_terminated_string(&mut output, "hi.txt").unwrap();
        assert_eq!(output, b"hi.txt\0");
        let mut reader = Cursor::new(output);
        let string = read_null_terminated_string(&mut reader, false).unwrap();
        assert_eq!(string, "hi.txt");
        assert_eq!(reader.position(), 7);
    }

    #[test]
    fn utf8_string_roundtrip() {
        let mut output = Vec::new();
        write_null_terminated_string(&mut output, "\u{2603}.txt").unwrap();
        assert_eq!(output, b"\xe2\x98\x83.txt\0");
        let mut reader = Cursor::new(output);
        let string = read_null_terminated_string(&mut reader, true).unwrap();
        assert_eq!(string, "\u{2603}.txt");
    }

    #[test]
    fn eof_before_terminator_is_truncation() {
        let mut reader = Cursor::new(b"no terminator".to_vec());
        let err = read_null_terminated_string(&mut reader, false).unwrap_err();
        assert!(matches!(err, CabError::TruncatedStream("string")));
    }

    #[test]
    fn overlong_string_is_rejected_both_ways() {
        let long = "x".repeat(256);
        let mut output = Vec::new();
        let err =
            write_null_terminated_string(&mut output, &long).unwrap_err();
        assert!(matches!(err, CabError::NameTooLong { length: 256, .. }));

        let mut bytes = vec![b'x'; 256];
        bytes.push(0);
        let mut reader = Cursor::new(bytes);
        let err = read_null_terminated_string(&mut reader, false).unwrap_err();
        assert!(matches!(err, CabError::NameTooLong { .. }));
    }
}
