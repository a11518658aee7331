use std::io::{Read, Write};
use std::path::PathBuf;
use std::slice;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use time::PrimitiveDateTime;

use crate::consts;
use crate::datetime::datetime_from_bits;
use crate::error::{truncated, Result};
use crate::string::{
    read_null_terminated_string, write_null_terminated_string,
};

/// An iterator over the file entries in a folder.
#[derive(Clone)]
pub struct FileEntries<'a> {
    pub(crate) iter: slice::Iter<'a, FileEntry>,
}

impl<'a> Iterator for FileEntries<'a> {
    type Item = &'a FileEntry;

    fn next(&mut self) -> Option<&'a FileEntry> {
        self.iter.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl<'a> ExactSizeIterator for FileEntries<'a> {}

/// Metadata about one file stored in a cabinet.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub(crate) name: String,
    pub(crate) date: u16,
    pub(crate) time: u16,
    pub(crate) uncompressed_size: u32,
    pub(crate) uncompressed_offset: u32,
    pub(crate) folder_index: u16,
    pub(crate) attributes: u16,
    pub(crate) source_path: Option<PathBuf>,
}

impl FileEntry {
    /// Returns the name of file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the datetime for this file.  According to the CAB spec, this
    /// "is typically considered the 'last modified' time in local time, but
    /// the actual definition is application-defined."
    ///
    /// Note that this will return [`None`] if the datetime in the cabinet
    /// file was not a valid date/time.
    pub fn datetime(&self) -> Option<PrimitiveDateTime> {
        datetime_from_bits(self.date, self.time)
    }

    /// Returns the total size of the file when decompressed, in bytes.
    pub fn uncompressed_size(&self) -> u32 {
        self.uncompressed_size
    }

    /// Returns true if this file has the "read-only" attribute set.
    pub fn is_read_only(&self) -> bool {
        (self.attributes & consts::ATTR_READ_ONLY) != 0
    }

    /// Returns true if this file has the "hidden" attribute set.
    pub fn is_hidden(&self) -> bool {
        (self.attributes & consts::ATTR_HIDDEN) != 0
    }

    /// Returns true if this file has the "system file" attribute set.
    pub fn is_system(&self) -> bool {
        (self.attributes & consts::ATTR_SYSTEM) != 0
    }

    /// Returns true if this file has the "archive" (modified since last
    /// backup) attribute set.
    pub fn is_archive(&self) -> bool {
        (self.attributes & consts::ATTR_ARCH) != 0
    }

    /// Returns true if this file has the "execute after extraction"
    /// attribute set.
    pub fn is_exec(&self) -> bool {
        (self.attributes & consts::ATTR_EXEC) != 0
    }

    /// Returns true if this file has the "name is UTF" attribute set.
    pub fn is_name_utf(&self) -> bool {
        (self.attributes & consts::ATTR_NAME_IS_UTF) != 0
    }

    /// Returns true if this entry's bytes are still pending in an external
    /// file that has not been written into the cabinet yet.
    pub fn is_pending(&self) -> bool {
        self.source_path.is_some()
    }

    /// Name comparison is ASCII-case-insensitive, matching the filesystems
    /// cabinets are built from.
    pub(crate) fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

pub(crate) fn parse_file_entry<R: Read>(reader: &mut R) -> Result<FileEntry> {
    let uncompressed_size = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "file header"))?;
    let uncompressed_offset = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "file header"))?;
    let folder_index = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "file header"))?;
    let date = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "file header"))?;
    let time = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "file header"))?;
    let attributes = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "file header"))?;
    let is_utf8 = (attributes & consts::ATTR_NAME_IS_UTF) != 0;
    let name = read_null_terminated_string(reader, is_utf8)?;
    Ok(FileEntry {
        name,
        date,
        time,
        uncompressed_size,
        uncompressed_offset,
        folder_index,
        attributes,
        source_path: None,
    })
}

/// Emits a file header.  The folder index and offset come from the caller
/// (the save pipeline recomputes both), and the UTF-8 name attribute is
/// re-derived from the name bytes: an all-ASCII name clears it.
pub(crate) fn write_file_entry<W: Write>(
    writer: &mut W,
    file: &FileEntry,
    folder_index: u16,
    uncompressed_offset: u32,
) -> Result<()> {
    let name_is_utf = file.name.bytes().any(|byte| byte > 0x7f);
    let mut attributes = file.attributes & !consts::ATTR_NAME_IS_UTF;
    if name_is_utf {
        attributes |= consts::ATTR_NAME_IS_UTF;
    }
    writer.write_u32::<LittleEndian>(file.uncompressed_size)?;
    writer.write_u32::<LittleEndian>(uncompressed_offset)?;
    writer.write_u16::<LittleEndian>(folder_index)?;
    writer.write_u16::<LittleEndian>(file.date)?;
    writer.write_u16::<LittleEndian>(file.time)?;
    writer.write_u16::<LittleEndian>(attributes)?;
    write_null_terminated_string(writer, &file.name)?;
    Ok(())
}
