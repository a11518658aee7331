use crate::error::{CabError, Result};

const CTYPE_NONE: u16 = 0;
const CTYPE_MSZIP: u16 = 1;
const CTYPE_QUANTUM: u16 = 2;
const CTYPE_LZX: u16 = 3;
const CTYPE_BAD: u16 = 0x000f;

/// A scheme for compressing data within the cabinet.
///
/// Only [`None`](CompressionType::None) (the "store" scheme) can actually be
/// read or written; the other values are recognized so that cabinets using
/// them can be inspected, but any attempt to move their data fails with
/// [`CabError::UnsupportedCompression`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression; data blocks hold the raw bytes.
    None,
    /// MSZIP compression.  MSZIP is described further in
    /// [MS-MCI](https://msdn.microsoft.com/en-us/library/cc483131.aspx).
    MsZip,
    /// Quantum compression with the given level and memory.
    Quantum(u16, u16),
    /// LZX compression with the given window size.  The LZX compression
    /// scheme is described further in
    /// [MS-PATCH](https://msdn.microsoft.com/en-us/library/cc483133.aspx).
    Lzx(u16),
    /// The reserved "bad" compression value.
    Bad,
}

impl CompressionType {
    pub(crate) fn from_bitfield(bits: u16) -> Result<CompressionType> {
        let ctype = bits & 0x000f;
        if ctype == CTYPE_NONE {
            Ok(CompressionType::None)
        } else if ctype == CTYPE_MSZIP {
            Ok(CompressionType::MsZip)
        } else if ctype == CTYPE_QUANTUM {
            let level = (bits & 0x00f0) >> 4;
            let memory = (bits & 0x1f00) >> 8;
            Ok(CompressionType::Quantum(level, memory))
        } else if ctype == CTYPE_LZX {
            let window = (bits & 0x1f00) >> 8;
            Ok(CompressionType::Lzx(window))
        } else if ctype == CTYPE_BAD {
            Ok(CompressionType::Bad)
        } else {
            Err(CabError::unsupported(format!(
                "invalid compression type: 0x{:04x}",
                bits
            )))
        }
    }

    pub(crate) fn to_bitfield(self) -> u16 {
        match self {
            CompressionType::None => CTYPE_NONE,
            CompressionType::MsZip => CTYPE_MSZIP,
            CompressionType::Quantum(level, memory) => {
                CTYPE_QUANTUM | ((level & 0xf) << 4) | ((memory & 0x1f) << 8)
            }
            CompressionType::Lzx(window) => {
                CTYPE_LZX | ((window & 0x1f) << 8)
            }
            CompressionType::Bad => CTYPE_BAD,
        }
    }

    pub(crate) fn compressor(
        self,
        folder_index: usize,
    ) -> Result<Box<dyn Compressor>> {
        match self {
            CompressionType::None => Ok(Box::new(StoreCodec)),
            other => Err(CabError::UnsupportedCompression {
                folder_index,
                ctype: other,
            }),
        }
    }

    pub(crate) fn decompressor(
        self,
        folder_index: usize,
    ) -> Result<Box<dyn Decompressor>> {
        match self {
            CompressionType::None => Ok(Box::new(StoreCodec)),
            other => Err(CabError::UnsupportedCompression {
                folder_index,
                ctype: other,
            }),
        }
    }
}

/// Compresses one data block's worth of bytes at a time.
pub(crate) trait Compressor {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

impl std::fmt::Debug for dyn Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn Compressor>")
    }
}

/// Decompresses one data block's payload at a time.
pub(crate) trait Decompressor {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

/// The store codec: both directions are the identity.
struct StoreCodec;

impl Compressor for StoreCodec {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

impl Decompressor for StoreCodec {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::CompressionType;
    use crate::error::CabError;

    #[test]
    fn compression_type_to_bitfield() {
        assert_eq!(CompressionType::None.to_bitfield(), 0x0);
        assert_eq!(CompressionType::MsZip.to_bitfield(), 0x1);
        assert_eq!(CompressionType::Quantum(7, 20).to_bitfield(), 0x1472);
        assert_eq!(CompressionType::Lzx(21).to_bitfield(), 0x1503);
        assert_eq!(CompressionType::Bad.to_bitfield(), 0x000f);
    }

    #[test]
    fn compression_type_from_bitfield() {
        assert_eq!(
            CompressionType::from_bitfield(0x0).unwrap(),
            CompressionType::None
        );
        assert_eq!(
            CompressionType::from_bitfield(0x1).unwrap(),
            CompressionType::MsZip
        );
        assert_eq!(
            CompressionType::from_bitfield(0x1472).unwrap(),
            CompressionType::Quantum(7, 20)
        );
        assert_eq!(
            CompressionType::from_bitfield(0x1503).unwrap(),
            CompressionType::Lzx(21)
        );
        assert_eq!(
            CompressionType::from_bitfield(0x000f).unwrap(),
            CompressionType::Bad
        );
        assert!(CompressionType::from_bitfield(0x0004).is_err());
    }

    #[test]
    fn store_is_the_only_working_codec() {
        let mut compressor = CompressionType::None.compressor(0).unwrap();
        assert_eq!(compressor.compress(b"hello").unwrap(), b"hello");
        let mut decompressor =
            CompressionType::None.decompressor(0).unwrap();
        assert_eq!(decompressor.decompress(b"hello").unwrap(), b"hello");

        let err = CompressionType::MsZip.compressor(3).unwrap_err();
        assert!(matches!(
            err,
            CabError::UnsupportedCompression {
                folder_index: 3,
                ctype: CompressionType::MsZip,
            }
        ));
        assert!(CompressionType::Lzx(21).decompressor(0).is_err());
        assert!(CompressionType::Quantum(7, 20).compressor(0).is_err());
        assert!(CompressionType::Bad.decompressor(0).is_err());
    }
}
