use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::slice;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::block::{self, DataBlockEntry};
use crate::consts;
use crate::ctype::{CompressionType, Compressor, Decompressor};
use crate::error::{truncated, CabError, Result};
use crate::file::{FileEntries, FileEntry};
use crate::progress::CancelToken;

/// An iterator over the folder entries in a cabinet.
#[derive(Clone)]
pub struct FolderEntries<'a> {
    pub(crate) iter: slice::Iter<'a, FolderEntry>,
}

impl<'a> Iterator for FolderEntries<'a> {
    type Item = &'a FolderEntry;

    fn next(&mut self) -> Option<&'a FolderEntry> {
        self.iter.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl<'a> ExactSizeIterator for FolderEntries<'a> {}

/// Data-block headers are read on first need, not at open.
#[derive(Debug)]
pub(crate) enum BlockState {
    Unread,
    Loaded(Vec<DataBlockEntry>),
}

/// Metadata about one folder in a cabinet.
#[derive(Debug)]
pub struct FolderEntry {
    pub(crate) first_data_block_offset: u32,
    pub(crate) num_data_blocks: u16,
    pub(crate) compression_type: CompressionType,
    pub(crate) reserve_data: Vec<u8>,
    pub(crate) files: Vec<FileEntry>,
    pub(crate) blocks: BlockState,
}

impl FolderEntry {
    /// Returns the scheme used to compress this folder's data.
    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    /// Returns the number of data blocks used to store this folder's data.
    pub fn num_data_blocks(&self) -> u16 {
        self.num_data_blocks
    }

    /// Returns the application-defined reserve data for this folder.
    pub fn reserve_data(&self) -> &[u8] {
        &self.reserve_data
    }

    /// Returns an iterator over the file entries in this folder.
    pub fn file_entries(&self) -> FileEntries {
        FileEntries { iter: self.files.iter() }
    }

    /// Sum of the folder's file sizes, i.e. the uncompressed byte count the
    /// folder's data blocks cover after a save.
    pub(crate) fn uncompressed_size(&self) -> u64 {
        self.files.iter().map(|file| file.uncompressed_size as u64).sum()
    }

    pub(crate) fn new_empty() -> FolderEntry {
        FolderEntry {
            first_data_block_offset: 0,
            num_data_blocks: 0,
            compression_type: CompressionType::None,
            reserve_data: Vec::new(),
            files: Vec::new(),
            blocks: BlockState::Loaded(Vec::new()),
        }
    }

    /// Walks the folder's block headers from `first_data_block_offset`,
    /// recording each payload offset and uncompressed start.  Idempotent.
    pub(crate) fn load_blocks<R: Read + Seek>(
        &mut self,
        reader: &mut R,
        data_reserve_size: usize,
    ) -> Result<()> {
        if let BlockState::Loaded(_) = self.blocks {
            return Ok(());
        }
        let mut blocks = Vec::with_capacity(self.num_data_blocks as usize);
        let mut uncompressed_offset = 0u64;
        reader.seek(SeekFrom::Start(self.first_data_block_offset as u64))?;
        for _ in 0..self.num_data_blocks {
            let entry = block::parse_block_entry(
                reader,
                uncompressed_offset,
                data_reserve_size,
            )?;
            uncompressed_offset = entry.uncompressed_end();
            blocks.push(entry);
        }
        debug!(
            num_blocks = blocks.len(),
            uncompressed_size = uncompressed_offset,
            "loaded folder data-block headers"
        );
        self.blocks = BlockState::Loaded(blocks);
        Ok(())
    }

    pub(crate) fn loaded_blocks(&self) -> &[DataBlockEntry] {
        match &self.blocks {
            BlockState::Loaded(blocks) => blocks,
            BlockState::Unread => {
                unreachable!("folder data-block headers not loaded")
            }
        }
    }
}

pub(crate) fn parse_folder_entry<R: Read>(
    reader: &mut R,
    reserve_size: usize,
) -> Result<FolderEntry> {
    let first_data_offset = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "folder header"))?;
    let num_data_blocks = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "folder header"))?;
    let compression_bits = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "folder header"))?;
    let compression_type = CompressionType::from_bitfield(compression_bits)?;
    let mut reserve_data = vec![0u8; reserve_size];
    if reserve_size > 0 {
        reader
            .read_exact(&mut reserve_data)
            .map_err(|e| truncated(e, "folder header"))?;
    }
    Ok(FolderEntry {
        first_data_block_offset: first_data_offset,
        num_data_blocks,
        compression_type,
        reserve_data,
        files: Vec::new(),
        blocks: BlockState::Unread,
    })
}

/// Emits a folder header with placeholder offset and block count; the save
/// pipeline patches both once the folder's data has been streamed.
pub(crate) fn write_folder_entry<W: Write>(
    writer: &mut W,
    folder: &FolderEntry,
    ctype: CompressionType,
    reserve_size: usize,
) -> Result<()> {
    writer.write_u32::<LittleEndian>(0)?; // first data block, patched later
    writer.write_u16::<LittleEndian>(0)?; // data block count, patched later
    writer.write_u16::<LittleEndian>(ctype.to_bitfield())?;
    if reserve_size > 0 {
        let mut reserve = folder.reserve_data.clone();
        reserve.resize(reserve_size, 0);
        writer.write_all(&reserve)?;
    }
    Ok(())
}

/// A reader for streaming uncompressed bytes out of one folder's data
/// blocks.  One decompressed block is cached at a time; blocks are visited
/// in order, and a block's range is `[offset, offset + len)` with the upper
/// bound exclusive.
pub(crate) struct FolderReader<'a, R> {
    reader: &'a mut R,
    blocks: &'a [DataBlockEntry],
    decompressor: Box<dyn Decompressor>,
    total_size: u64,
    current_block_index: usize,
    current_block_data: Vec<u8>,
    offset_within_folder: u64,
}

impl<'a, R: Read + Seek> FolderReader<'a, R> {
    pub(crate) fn new(
        reader: &'a mut R,
        folder: &'a FolderEntry,
        folder_index: usize,
    ) -> Result<FolderReader<'a, R>> {
        let blocks = folder.loaded_blocks();
        let decompressor =
            folder.compression_type.decompressor(folder_index)?;
        let total_size =
            blocks.last().map(|b| b.uncompressed_end()).unwrap_or(0);
        Ok(FolderReader {
            reader,
            blocks,
            decompressor,
            total_size,
            current_block_index: 0,
            current_block_data: Vec::new(),
            offset_within_folder: 0,
        })
    }

    fn current_block_start(&self) -> u64 {
        if self.current_block_index < self.blocks.len() {
            self.blocks[self.current_block_index].uncompressed_offset
        } else {
            self.total_size
        }
    }

    /// Positions the cursor at the given uncompressed offset within the
    /// folder.  Seeking backward rewinds to the first block and scans
    /// forward again on the next read.
    pub(crate) fn seek_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.total_size {
            return Err(CabError::TruncatedStream("folder data"));
        }
        if offset < self.current_block_start() {
            self.current_block_index = 0;
            self.current_block_data = Vec::new();
        }
        self.offset_within_folder = offset;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the cursor; returns 0 only at the
    /// end of the folder.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.offset_within_folder == self.total_size {
            return Ok(0);
        }
        // Advance to the block whose range contains the cursor.
        while self.current_block_index < self.blocks.len() {
            let entry = &self.blocks[self.current_block_index];
            if entry.uncompressed_size == 0 {
                return Err(CabError::unsupported(format!(
                    "data block {} continues into the next cabinet",
                    self.current_block_index
                )));
            }
            if self.offset_within_folder < entry.uncompressed_end() {
                break;
            }
            self.current_block_index += 1;
            self.current_block_data.clear();
        }
        if self.current_block_index >= self.blocks.len() {
            return Err(CabError::TruncatedStream("folder data"));
        }
        let entry = &self.blocks[self.current_block_index];
        if self.current_block_data.is_empty() {
            self.current_block_data = block::read_block_uncompressed(
                &mut *self.reader,
                entry,
                self.current_block_index,
                self.decompressor.as_mut(),
            )?;
        }
        let offset_within_block =
            (self.offset_within_folder - entry.uncompressed_offset) as usize;
        let max_bytes = buf
            .len()
            .min(self.current_block_data.len() - offset_within_block);
        buf[..max_bytes].copy_from_slice(
            &self.current_block_data[offset_within_block..][..max_bytes],
        );
        self.offset_within_folder += max_bytes as u64;
        Ok(max_bytes)
    }
}

/// Packs producer bytes into data blocks of at most 32 KiB of uncompressed
/// content, emitting each through the folder's compressor.
struct BlockWriter<'a, W> {
    writer: &'a mut W,
    compressor: Box<dyn Compressor>,
    data_reserve_size: usize,
    staging: Vec<u8>,
    num_blocks: usize,
}

impl<'a, W: Write + Seek> BlockWriter<'a, W> {
    fn push(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let room =
                consts::MAX_UNCOMPRESSED_BLOCK_SIZE - self.staging.len();
            let take = room.min(bytes.len());
            self.staging.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.staging.len() == consts::MAX_UNCOMPRESSED_BLOCK_SIZE {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        if self.num_blocks == consts::MAX_NUM_DATA_BLOCKS {
            return Err(CabError::TooManyDataBlocks);
        }
        block::write_data_block(
            &mut *self.writer,
            &self.staging,
            self.data_reserve_size,
            self.compressor.as_mut(),
        )?;
        self.staging.clear();
        self.num_blocks += 1;
        Ok(())
    }
}

/// Streams one folder's data blocks into `writer`, mixing bytes from
/// pending external files with bytes read back out of the original
/// cabinet's blocks at each file's pre-save uncompressed offset.  New
/// blocks are compressed with `ctype` (the scheme being assigned to every
/// folder); existing blocks are read with the folder's current scheme.
/// Returns the folder's new first-block offset and block count for header
/// patching.
pub(crate) fn rewrite_data_blocks<R: Read + Seek, W: Write + Seek>(
    folder: &FolderEntry,
    folder_index: usize,
    ctype: CompressionType,
    mut source: Option<&mut R>,
    writer: &mut W,
    data_reserve_size: usize,
    progress: &mut dyn FnMut(&str, u64),
    cancel: &CancelToken,
) -> Result<(u32, u16)> {
    let first_block_offset = writer.stream_position()?;
    if first_block_offset > consts::MAX_TOTAL_CAB_SIZE as u64 {
        return Err(CabError::CabinetTooLarge { size: first_block_offset });
    }
    let mut out = BlockWriter {
        writer,
        compressor: ctype.compressor(folder_index)?,
        data_reserve_size,
        staging: Vec::with_capacity(consts::MAX_UNCOMPRESSED_BLOCK_SIZE),
        num_blocks: 0,
    };
    let mut chunk = vec![0u8; consts::MAX_UNCOMPRESSED_BLOCK_SIZE];
    for file in &folder.files {
        cancel.check()?;
        if let Some(path) = &file.source_path {
            let mut external = File::open(path).map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    CabError::MissingSource {
                        name: file.name.clone(),
                        path: path.clone(),
                    }
                } else {
                    CabError::Io(err)
                }
            })?;
            loop {
                let count = external.read(&mut chunk)?;
                if count == 0 {
                    break;
                }
                out.push(&chunk[..count])?;
                progress(&file.name, count as u64);
                cancel.check()?;
            }
        } else {
            let reader = match source {
                Some(ref mut reader) => &mut **reader,
                None => unreachable!(
                    "cabinet-resident file without a read handle"
                ),
            };
            let mut folder_reader =
                FolderReader::new(reader, folder, folder_index)?;
            folder_reader.seek_to(file.uncompressed_offset as u64)?;
            let mut remaining = file.uncompressed_size as u64;
            while remaining > 0 {
                let want = remaining.min(chunk.len() as u64) as usize;
                let count = folder_reader.read(&mut chunk[..want])?;
                if count == 0 {
                    return Err(CabError::TruncatedStream("folder data"));
                }
                out.push(&chunk[..count])?;
                remaining -= count as u64;
                progress(&file.name, count as u64);
                cancel.check()?;
            }
        }
    }
    out.flush_block()?;
    let num_blocks = out.num_blocks as u16;
    debug!(
        folder_index,
        num_blocks, first_block_offset, "rewrote folder data blocks"
    );
    Ok((first_block_offset as u32, num_blocks))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{
        parse_folder_entry, rewrite_data_blocks, write_folder_entry,
        BlockState, FolderEntry, FolderReader,
    };
    use crate::ctype::CompressionType;
    use crate::error::CabError;
    use crate::file::parse_file_entry;
    use crate::progress::CancelToken;

    fn folder_with_two_blocks() -> (FolderEntry, Vec<u8>) {
        // Two stored blocks: "Hello," then " world!\n".
        let stream: &[u8] = b"\0\0\0\0\x06\0\x06\0Hello,\
            \0\0\0\0\x08\0\x08\0 world!\n";
        let mut folder = FolderEntry {
            first_data_block_offset: 0,
            num_data_blocks: 2,
            compression_type: CompressionType::None,
            reserve_data: Vec::new(),
            files: Vec::new(),
            blocks: BlockState::Unread,
        };
        let mut reader = Cursor::new(stream.to_vec());
        folder.load_blocks(&mut reader, 0).unwrap();
        (folder, stream.to_vec())
    }

    #[test]
    fn folder_header_roundtrip() {
        let binary: &[u8] = b"\x43\0\0\0\x02\0\x01\0";
        let mut reader = Cursor::new(binary);
        let folder = parse_folder_entry(&mut reader, 0).unwrap();
        assert_eq!(folder.first_data_block_offset, 0x43);
        assert_eq!(folder.num_data_blocks(), 2);
        assert_eq!(folder.compression_type(), CompressionType::MsZip);

        let mut output = Vec::new();
        write_folder_entry(
            &mut output,
            &folder,
            CompressionType::MsZip,
            0,
        )
        .unwrap();
        // Offset and count are placeholders until the data is streamed.
        assert_eq!(output, b"\0\0\0\0\0\0\x01\0");
    }

    #[test]
    fn load_blocks_reports_truncation() {
        let mut folder = FolderEntry {
            first_data_block_offset: 0,
            num_data_blocks: 2,
            compression_type: CompressionType::None,
            reserve_data: Vec::new(),
            files: Vec::new(),
            blocks: BlockState::Unread,
        };
        let mut reader =
            Cursor::new(b"\0\0\0\0\x06\0\x06\0Hello,".to_vec());
        let err = folder.load_blocks(&mut reader, 0).unwrap_err();
        assert!(matches!(err, CabError::TruncatedStream(_)));
    }

    #[test]
    fn reader_streams_across_block_boundaries() {
        let (folder, stream) = folder_with_two_blocks();
        let mut reader = Cursor::new(stream);
        let mut folder_reader =
            FolderReader::new(&mut reader, &folder, 0).unwrap();
        let mut data = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let count = folder_reader.read(&mut buf).unwrap();
            if count == 0 {
                break;
            }
            data.extend_from_slice(&buf[..count]);
        }
        assert_eq!(data, b"Hello, world!\n");
    }

    #[test]
    fn reader_seeks_forward_and_backward() {
        let (folder, stream) = folder_with_two_blocks();
        let mut reader = Cursor::new(stream);
        let mut folder_reader =
            FolderReader::new(&mut reader, &folder, 0).unwrap();
        let mut buf = [0u8; 6];
        folder_reader.seek_to(7).unwrap();
        assert_eq!(folder_reader.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"world!");
        folder_reader.seek_to(1).unwrap();
        assert_eq!(folder_reader.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"ello,");
        assert!(folder_reader.seek_to(15).is_err());
    }

    #[test]
    fn rewrite_repacks_existing_blocks() {
        let (mut folder, stream) = folder_with_two_blocks();
        // One file covering the folder's whole uncompressed range.
        let header: &[u8] =
            b"\x0e\0\0\0\0\0\0\0\0\0\x6c\x22\xba\x59\x20\0hi.txt\0";
        folder.files.push(
            parse_file_entry(&mut Cursor::new(header)).unwrap(),
        );

        let mut source = Cursor::new(stream);
        let mut output = Cursor::new(Vec::new());
        let mut chunks = Vec::new();
        let (first_offset, num_blocks) = rewrite_data_blocks(
            &folder,
            0,
            CompressionType::None,
            Some(&mut source),
            &mut output,
            0,
            &mut |name, bytes| chunks.push((name.to_string(), bytes)),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(first_offset, 0);
        // The two source blocks fit one staging buffer, so they coalesce.
        assert_eq!(num_blocks, 1);
        assert_eq!(
            output.into_inner(),
            b"\0\0\0\0\x0e\0\x0e\0Hello, world!\n"
        );
        // One progress report per source block visited.
        assert_eq!(
            chunks,
            vec![("hi.txt".to_string(), 6), ("hi.txt".to_string(), 8)]
        );
    }

    #[test]
    fn rewrite_observes_cancellation() {
        let (mut folder, stream) = folder_with_two_blocks();
        let header: &[u8] =
            b"\x0e\0\0\0\0\0\0\0\0\0\x6c\x22\xba\x59\x20\0hi.txt\0";
        folder.files.push(
            parse_file_entry(&mut Cursor::new(header)).unwrap(),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut source = Cursor::new(stream);
        let mut output = Cursor::new(Vec::new());
        let err = rewrite_data_blocks(
            &folder,
            0,
            CompressionType::None,
            Some(&mut source),
            &mut output,
            0,
            &mut |_, _| {},
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, CabError::Cancelled));
    }
}
