use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::consts;
use crate::ctype::{Compressor, Decompressor};
use crate::error::{truncated, CabError, Result};

/// One CFDATA record: the header fields plus derived stream offsets.  The
/// compressed payload stays on disk until a reader needs it.
#[derive(Debug, Clone)]
pub(crate) struct DataBlockEntry {
    pub(crate) checksum: u32,
    pub(crate) compressed_size: u16,
    pub(crate) uncompressed_size: u16,
    pub(crate) reserve_data: Vec<u8>,
    /// Offset of the payload within the cabinet stream.
    pub(crate) data_offset: u64,
    /// Offset of this block's first byte within the folder's uncompressed
    /// stream.
    pub(crate) uncompressed_offset: u64,
}

impl DataBlockEntry {
    pub(crate) fn uncompressed_end(&self) -> u64 {
        self.uncompressed_offset + self.uncompressed_size as u64
    }
}

/// Parses a block header at the current stream position and seeks past the
/// payload, leaving the stream at the next block header.
pub(crate) fn parse_block_entry<R: Read + Seek>(
    reader: &mut R,
    uncompressed_offset: u64,
    data_reserve_size: usize,
) -> Result<DataBlockEntry> {
    let checksum = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "data block header"))?;
    let compressed_size = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "data block header"))?;
    let uncompressed_size = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "data block header"))?;
    let mut reserve_data = vec![0u8; data_reserve_size];
    if data_reserve_size > 0 {
        reader
            .read_exact(&mut reserve_data)
            .map_err(|e| truncated(e, "data block header"))?;
    }
    let data_offset = reader.stream_position()?;
    reader.seek(SeekFrom::Current(compressed_size as i64))?;
    Ok(DataBlockEntry {
        checksum,
        compressed_size,
        uncompressed_size,
        reserve_data,
        data_offset,
        uncompressed_offset,
    })
}

pub(crate) fn read_block_payload<R: Read + Seek>(
    reader: &mut R,
    block: &DataBlockEntry,
) -> Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(block.data_offset))?;
    let mut payload = vec![0u8; block.compressed_size as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| truncated(e, "data block payload"))?;
    Ok(payload)
}

/// Reads and decompresses one block, verifying the declared uncompressed
/// length.  A zero uncompressed length marks a block continued into the
/// next cabinet of a set, which cannot be read here.
pub(crate) fn read_block_uncompressed<R: Read + Seek>(
    reader: &mut R,
    block: &DataBlockEntry,
    block_index: usize,
    decompressor: &mut dyn Decompressor,
) -> Result<Vec<u8>> {
    if block.uncompressed_size == 0 {
        return Err(CabError::unsupported(format!(
            "data block {} continues into the next cabinet",
            block_index
        )));
    }
    let payload = read_block_payload(reader, block)?;
    let data = decompressor.decompress(&payload)?;
    if data.len() != block.uncompressed_size as usize {
        return Err(CabError::CorruptedData {
            block_index,
            expected: block.uncompressed_size as usize,
            actual: data.len(),
        });
    }
    Ok(data)
}

/// Compresses and emits one block at the current writer position.  The
/// checksum field is written as zero; it is never computed.
pub(crate) fn write_data_block<W: Write>(
    writer: &mut W,
    data: &[u8],
    data_reserve_size: usize,
    compressor: &mut dyn Compressor,
) -> Result<()> {
    debug_assert!(!data.is_empty());
    debug_assert!(data.len() <= consts::MAX_UNCOMPRESSED_BLOCK_SIZE);
    let compressed = compressor.compress(data)?;
    writer.write_u32::<LittleEndian>(0)?;
    writer.write_u16::<LittleEndian>(compressed.len() as u16)?;
    writer.write_u16::<LittleEndian>(data.len() as u16)?;
    if data_reserve_size > 0 {
        writer.write_all(&vec![0u8; data_reserve_size])?;
    }
    writer.write_all(&compressed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{
        parse_block_entry, read_block_uncompressed, write_data_block,
    };
    use crate::ctype::CompressionType;
    use crate::error::CabError;

    #[test]
    fn block_write_then_parse() {
        let mut compressor = CompressionType::None.compressor(0).unwrap();
        let mut output = Vec::new();
        write_data_block(
            &mut output,
            b"Hello, world!\n",
            0,
            compressor.as_mut(),
        )
        .unwrap();
        assert_eq!(output, b"\0\0\0\0\x0e\0\x0e\0Hello, world!\n");

        let mut reader = Cursor::new(output);
        let block = parse_block_entry(&mut reader, 0, 0).unwrap();
        assert_eq!(block.checksum, 0);
        assert_eq!(block.compressed_size, 14);
        assert_eq!(block.uncompressed_size, 14);
        assert_eq!(block.data_offset, 8);
        assert_eq!(reader.position(), 22);

        let mut decompressor =
            CompressionType::None.decompressor(0).unwrap();
        let data = read_block_uncompressed(
            &mut reader,
            &block,
            0,
            decompressor.as_mut(),
        )
        .unwrap();
        assert_eq!(data, b"Hello, world!\n");
    }

    #[test]
    fn block_with_reserve_area() {
        let binary: &[u8] = b"\x78\x56\x34\x12\x05\0\x05\0abcdhello";
        let mut reader = Cursor::new(binary);
        let block = parse_block_entry(&mut reader, 100, 4).unwrap();
        assert_eq!(block.checksum, 0x12345678);
        assert_eq!(block.reserve_data, b"abcd");
        assert_eq!(block.data_offset, 12);
        assert_eq!(block.uncompressed_offset, 100);
        assert_eq!(block.uncompressed_end(), 105);
    }

    #[test]
    fn declared_length_mismatch_is_corruption() {
        let binary: &[u8] = b"\0\0\0\0\x03\0\x05\0abc";
        let mut reader = Cursor::new(binary);
        let block = parse_block_entry(&mut reader, 0, 0).unwrap();
        let mut decompressor =
            CompressionType::None.decompressor(0).unwrap();
        let err = read_block_uncompressed(
            &mut reader,
            &block,
            7,
            decompressor.as_mut(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CabError::CorruptedData { block_index: 7, expected: 5, actual: 3 }
        ));
    }

    #[test]
    fn truncated_header_is_reported() {
        let mut reader = Cursor::new(b"\0\0\0\0\x03".to_vec());
        let err = parse_block_entry(&mut reader, 0, 0).unwrap_err();
        assert!(matches!(err, CabError::TruncatedStream(_)));
    }
}
