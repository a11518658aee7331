use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::consts;
use crate::ctype::CompressionType;
use crate::datetime::{datetime_from_system_time, datetime_to_bits};
use crate::error::{truncated, CabError, Result};
use crate::file::{parse_file_entry, write_file_entry, FileEntry};
use crate::folder::{
    self, parse_folder_entry, write_folder_entry, BlockState, FolderEntries,
    FolderEntry, FolderReader,
};
use crate::progress::CancelToken;
use crate::string::{
    read_null_terminated_string, write_null_terminated_string,
};

/// A cabinet bound to a path on the host filesystem.
///
/// Opening an existing file parses its header, folder and file records but
/// leaves data-block headers unread until an operation needs them.  Opening
/// a path that does not exist yields an empty cabinet; files can be added
/// with [`add_external_file`](Cabinet::add_external_file) and the result
/// written out with [`save`](Cabinet::save).
///
/// Mutations touch in-memory records only.  [`save`](Cabinet::save) streams
/// a complete new cabinet into a sibling temporary file and atomically
/// replaces the original; until then, file bytes are sourced from the
/// original cabinet's data blocks (or from the external files pending
/// entries point at).
#[derive(Debug)]
pub struct Cabinet {
    path: PathBuf,
    reader: Option<File>,
    cabinet_set_id: u16,
    cabinet_set_index: u16,
    header_reserve_data: Vec<u8>,
    folder_reserve_size: u8,
    data_reserve_size: u8,
    prev_cabinet: Option<(String, String)>,
    folders: Vec<FolderEntry>,
}

#[derive(Debug)]
struct CabinetStructure {
    cabinet_set_id: u16,
    cabinet_set_index: u16,
    header_reserve_data: Vec<u8>,
    folder_reserve_size: u8,
    data_reserve_size: u8,
    prev_cabinet: Option<(String, String)>,
    folders: Vec<FolderEntry>,
}

impl Cabinet {
    /// Opens the cabinet at `path`.  A nonexistent path yields an empty
    /// cabinet bound to that path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Cabinet> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Cabinet {
                path,
                reader: None,
                cabinet_set_id: 0,
                cabinet_set_index: 0,
                header_reserve_data: Vec::new(),
                folder_reserve_size: 0,
                data_reserve_size: 0,
                prev_cabinet: None,
                folders: Vec::new(),
            });
        }
        let mut reader = File::open(&path)?;
        let structure = parse_cabinet(&mut reader)?;
        debug!(
            path = %path.display(),
            num_folders = structure.folders.len(),
            "opened cabinet"
        );
        Ok(Cabinet {
            path,
            reader: Some(reader),
            cabinet_set_id: structure.cabinet_set_id,
            cabinet_set_index: structure.cabinet_set_index,
            header_reserve_data: structure.header_reserve_data,
            folder_reserve_size: structure.folder_reserve_size,
            data_reserve_size: structure.data_reserve_size,
            prev_cabinet: structure.prev_cabinet,
            folders: structure.folders,
        })
    }

    /// Returns the path this cabinet is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cabinet set ID for this cabinet (an arbitrary number
    /// used to group together a set of cabinets).
    pub fn cabinet_set_id(&self) -> u16 {
        self.cabinet_set_id
    }

    /// Returns this cabinet's (zero-based) index within its cabinet set.
    pub fn cabinet_set_index(&self) -> u16 {
        self.cabinet_set_index
    }

    /// Returns the application-defined reserve data stored in the cabinet
    /// header.
    pub fn reserve_data(&self) -> &[u8] {
        &self.header_reserve_data
    }

    /// Returns an iterator over the folder entries in this cabinet.
    pub fn folder_entries(&self) -> FolderEntries {
        FolderEntries { iter: self.folders.iter() }
    }

    /// Returns the number of files stored in the cabinet.
    pub fn file_count(&self) -> usize {
        self.folders.iter().map(|folder| folder.files.len()).sum()
    }

    /// Returns the entry for the file with the given name, if any.  Name
    /// comparison is ASCII-case-insensitive.
    pub fn get_file_entry(&self, name: &str) -> Option<&FileEntry> {
        self.folders
            .iter()
            .flat_map(|folder| folder.files.iter())
            .find(|file| file.matches(name))
    }

    /// Adds (or replaces) a file whose bytes live at `source` on the host,
    /// stored under the relative cabinet path `name`.  The bytes are read
    /// when the cabinet is saved, not now.
    ///
    /// The entry lands in the first folder with room for it; a new folder
    /// is appended when none fits.  Newly added files always carry the
    /// "archive" attribute, plus "read-only" when the source file is.
    pub fn add_external_file<P: AsRef<Path>>(
        &mut self,
        source: P,
        name: &str,
    ) -> Result<()> {
        let source = source.as_ref();
        if self.file_count() + 1 > consts::MAX_NUM_FILES {
            return Err(CabError::TooManyFiles);
        }
        let metadata = fs::metadata(source).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                CabError::MissingSource {
                    name: name.to_string(),
                    path: source.to_path_buf(),
                }
            } else {
                CabError::Io(err)
            }
        })?;
        let size = metadata.len();
        if size > consts::MAX_FILE_SIZE as u64 {
            return Err(CabError::FileTooLarge {
                path: source.to_path_buf(),
                size,
            });
        }
        // Replace semantics: any entry already stored under this name goes
        // away.
        self.remove_matching(name);

        let (date, time) = match metadata.modified() {
            Ok(modified) => {
                datetime_to_bits(datetime_from_system_time(modified))
            }
            Err(_) => (0x21, 0), // 1980-01-01 00:00:00
        };
        let mut attributes = consts::ATTR_ARCH;
        if metadata.permissions().readonly() {
            attributes |= consts::ATTR_READ_ONLY;
        }
        let folder_index = self.select_folder(size);
        self.folders[folder_index].files.push(FileEntry {
            name: name.to_string(),
            date,
            time,
            uncompressed_size: size as u32,
            uncompressed_offset: 0,
            folder_index: folder_index as u16,
            attributes,
            source_path: Some(source.to_path_buf()),
        });
        Ok(())
    }

    /// Extracts the named file to `dest_path`.  Returns `Ok(false)` without
    /// touching the filesystem when no such file exists in the cabinet.
    /// The destination's last-write time and read-only attribute are set
    /// from the cabinet entry.
    pub fn extract_to_file<P: AsRef<Path>>(
        &mut self,
        name: &str,
        dest_path: P,
    ) -> Result<bool> {
        self.extract_to_file_with(
            name,
            dest_path,
            &mut |_, _| {},
            &CancelToken::new(),
        )
    }

    /// Like [`extract_to_file`](Cabinet::extract_to_file), reporting
    /// per-chunk progress and honoring a cancellation token.
    pub fn extract_to_file_with<P: AsRef<Path>>(
        &mut self,
        name: &str,
        dest_path: P,
        progress: &mut dyn FnMut(&str, u64),
        cancel: &CancelToken,
    ) -> Result<bool> {
        let (folder_index, file_index) = match self.find_file(name) {
            Some(found) => found,
            None => return Ok(false),
        };
        self.load_folder_blocks(folder_index)?;
        let folder = &self.folders[folder_index];
        let file = &folder.files[file_index];
        // A pending entry's bytes are still on the host; open them before
        // creating the destination so a missing source leaves no file.
        let pending = match &file.source_path {
            Some(source) => Some(File::open(source).map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    CabError::MissingSource {
                        name: file.name.clone(),
                        path: source.clone(),
                    }
                } else {
                    CabError::Io(err)
                }
            })?),
            None => None,
        };
        let mut dest = File::create(dest_path.as_ref())?;
        let mut chunk = vec![0u8; consts::MAX_UNCOMPRESSED_BLOCK_SIZE];
        if let Some(mut external) = pending {
            loop {
                let count = external.read(&mut chunk)?;
                if count == 0 {
                    break;
                }
                dest.write_all(&chunk[..count])?;
                progress(&file.name, count as u64);
                cancel.check()?;
            }
        } else {
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
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
                dest.write_all(&chunk[..count])?;
                progress(&file.name, count as u64);
                remaining -= count as u64;
                cancel.check()?;
            }
        }
        apply_file_metadata(&dest, file)?;
        Ok(true)
    }

    /// Removes every entry matching `name`.  Returns `Ok(true)` if at
    /// least one entry was removed; a missing name is not an error.
    pub fn delete_file(&mut self, name: &str) -> Result<bool> {
        self.load_all_blocks()?;
        Ok(self.remove_matching(name))
    }

    /// Renames the first entry matching `old_name` to `new_name`.  Returns
    /// `Ok(false)` when no entry matches.  The entry's bytes keep flowing
    /// from its original position in the cabinet when saving.
    pub fn move_file(
        &mut self,
        old_name: &str,
        new_name: &str,
    ) -> Result<bool> {
        self.load_all_blocks()?;
        match self.find_file(old_name) {
            Some((folder_index, file_index)) => {
                self.folders[folder_index].files[file_index].name =
                    new_name.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rewrites the cabinet at its bound path, applying the given
    /// compression type to every folder.  The new cabinet is streamed into
    /// a sibling temporary file which then replaces the original; on any
    /// failure the temporary is removed and the original is left intact.
    pub fn save(&mut self, ctype: CompressionType) -> Result<()> {
        self.save_with(ctype, &mut |_, _| {}, &CancelToken::new())
    }

    /// Like [`save`](Cabinet::save), reporting per-chunk progress and
    /// honoring a cancellation token.
    pub fn save_with(
        &mut self,
        ctype: CompressionType,
        progress: &mut dyn FnMut(&str, u64),
        cancel: &CancelToken,
    ) -> Result<()> {
        self.load_all_blocks()?;
        let mut temp_path = self.temp_path();
        while temp_path.exists() {
            temp_path = self.temp_path();
        }
        match self.write_and_swap(&temp_path, ctype, progress, cancel) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                Err(err)
            }
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.path
            .with_file_name(format!("~{:08x}", rand::random::<u32>()))
    }

    fn find_file(&self, name: &str) -> Option<(usize, usize)> {
        for (folder_index, folder) in self.folders.iter().enumerate() {
            for (file_index, file) in folder.files.iter().enumerate() {
                if file.matches(name) {
                    return Some((folder_index, file_index));
                }
            }
        }
        None
    }

    fn remove_matching(&mut self, name: &str) -> bool {
        let mut removed = false;
        for folder in &mut self.folders {
            let before = folder.files.len();
            folder.files.retain(|file| !file.matches(name));
            removed |= folder.files.len() != before;
        }
        removed
    }

    /// First folder with room for `size` more bytes and one more file; a
    /// new folder is appended when none fits.
    fn select_folder(&mut self, size: u64) -> usize {
        for (index, folder) in self.folders.iter().enumerate() {
            if folder.uncompressed_size() + size <= consts::MAX_FOLDER_SIZE
                && folder.files.len() < consts::MAX_NUM_FILES
            {
                return index;
            }
        }
        self.folders.push(FolderEntry::new_empty());
        self.folders.len() - 1
    }

    fn load_folder_blocks(&mut self, folder_index: usize) -> Result<()> {
        let data_reserve_size = self.data_reserve_size as usize;
        let folder = &mut self.folders[folder_index];
        if let BlockState::Unread = folder.blocks {
            match self.reader.as_mut() {
                Some(reader) => {
                    folder.load_blocks(reader, data_reserve_size)?
                }
                None => unreachable!("parsed folder without a read handle"),
            }
        }
        Ok(())
    }

    fn load_all_blocks(&mut self) -> Result<()> {
        for index in 0..self.folders.len() {
            self.load_folder_blocks(index)?;
        }
        Ok(())
    }

    fn header_flags(&self) -> u16 {
        let mut flags = 0u16;
        if self.prev_cabinet.is_some() {
            flags |= consts::FLAG_PREV_CABINET;
        }
        if !self.header_reserve_data.is_empty()
            || self.folder_reserve_size > 0
            || self.data_reserve_size > 0
        {
            flags |= consts::FLAG_RESERVE_PRESENT;
        }
        flags
    }

    fn write_and_swap(
        &mut self,
        temp_path: &Path,
        ctype: CompressionType,
        progress: &mut dyn FnMut(&str, u64),
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut writer = File::create(temp_path)?;
        let flags = self.header_flags();
        // Header layout mirrors the parse path: fixed 36 bytes, then the
        // flag-gated reserve areas and prev-cabinet names.
        let mut first_folder_offset = 36u32;
        if flags & consts::FLAG_RESERVE_PRESENT != 0 {
            first_folder_offset += 4 + self.header_reserve_data.len() as u32;
        }
        if let Some((cab_name, disk_name)) = &self.prev_cabinet {
            first_folder_offset +=
                cab_name.len() as u32 + disk_name.len() as u32 + 2;
        }
        let folder_entry_size = 8 + self.folder_reserve_size as u32;
        let first_file_offset = first_folder_offset
            + self.folders.len() as u32 * folder_entry_size;

        writer.write_u32::<LittleEndian>(consts::FILE_SIGNATURE)?;
        writer.write_u32::<LittleEndian>(0)?; // reserved1
        writer.write_u32::<LittleEndian>(0)?; // total size, patched at the end
        writer.write_u32::<LittleEndian>(0)?; // reserved2
        writer.write_u32::<LittleEndian>(first_file_offset)?;
        writer.write_u32::<LittleEndian>(0)?; // reserved3
        writer.write_u8(consts::VERSION_MINOR)?;
        writer.write_u8(consts::VERSION_MAJOR)?;
        writer.write_u16::<LittleEndian>(self.folders.len() as u16)?;
        writer.write_u16::<LittleEndian>(self.file_count() as u16)?;
        writer.write_u16::<LittleEndian>(flags)?;
        writer.write_u16::<LittleEndian>(self.cabinet_set_id)?;
        writer.write_u16::<LittleEndian>(self.cabinet_set_index)?;
        if flags & consts::FLAG_RESERVE_PRESENT != 0 {
            writer.write_u16::<LittleEndian>(
                self.header_reserve_data.len() as u16,
            )?;
            writer.write_u8(self.folder_reserve_size)?;
            writer.write_u8(self.data_reserve_size)?;
            writer.write_all(&self.header_reserve_data)?;
        }
        if let Some((cab_name, disk_name)) = &self.prev_cabinet {
            write_null_terminated_string(&mut writer, cab_name)?;
            write_null_terminated_string(&mut writer, disk_name)?;
        }

        // Folder headers, with their stream positions remembered for the
        // patch-back once each folder's data has been streamed.
        let mut folder_header_offsets =
            Vec::with_capacity(self.folders.len());
        for folder in &self.folders {
            folder_header_offsets.push(writer.stream_position()?);
            write_folder_entry(
                &mut writer,
                folder,
                ctype,
                self.folder_reserve_size as usize,
            )?;
        }

        // File headers in (folder index, uncompressed offset) order; each
        // file's new offset is the running sum of sizes within its folder.
        let mut new_offsets: Vec<Vec<u32>> =
            Vec::with_capacity(self.folders.len());
        for (folder_index, folder) in self.folders.iter().enumerate() {
            if folder.uncompressed_size() > consts::MAX_FOLDER_SIZE {
                return Err(CabError::unsupported(format!(
                    "folder {} is overfull ({} bytes; max is {} bytes)",
                    folder_index,
                    folder.uncompressed_size(),
                    consts::MAX_FOLDER_SIZE
                )));
            }
            let mut offsets = Vec::with_capacity(folder.files.len());
            let mut offset_within_folder = 0u64;
            for file in &folder.files {
                write_file_entry(
                    &mut writer,
                    file,
                    folder_index as u16,
                    offset_within_folder as u32,
                )?;
                offsets.push(offset_within_folder as u32);
                offset_within_folder += file.uncompressed_size as u64;
            }
            new_offsets.push(offsets);
        }

        // Data blocks for each folder, then patch that folder's header.
        let mut folder_results = Vec::with_capacity(self.folders.len());
        for (folder_index, folder) in self.folders.iter().enumerate() {
            cancel.check()?;
            let (first_block_offset, num_blocks) =
                folder::rewrite_data_blocks(
                    folder,
                    folder_index,
                    ctype,
                    self.reader.as_mut(),
                    &mut writer,
                    self.data_reserve_size as usize,
                    progress,
                    cancel,
                )?;
            let end = writer.stream_position()?;
            writer.seek(SeekFrom::Start(
                folder_header_offsets[folder_index],
            ))?;
            writer.write_u32::<LittleEndian>(first_block_offset)?;
            writer.write_u16::<LittleEndian>(num_blocks)?;
            writer.seek(SeekFrom::Start(end))?;
            folder_results.push((first_block_offset, num_blocks));
        }

        let total_size = writer.stream_position()?;
        if total_size > consts::MAX_TOTAL_CAB_SIZE as u64 {
            return Err(CabError::CabinetTooLarge { size: total_size });
        }
        writer.seek(SeekFrom::Start(8))?;
        writer.write_u32::<LittleEndian>(total_size as u32)?;
        writer.flush()?;
        drop(writer);

        // Swap the new cabinet into place.  The read handle is released
        // first so the original can be deleted on platforms that lock open
        // files.
        self.reader = None;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        fs::rename(temp_path, &self.path)?;

        // Commit the new layout to the in-memory records and re-open a
        // fresh read handle; block headers reload lazily on next use.
        for ((folder_index, folder), (offsets, result)) in self
            .folders
            .iter_mut()
            .enumerate()
            .zip(new_offsets.into_iter().zip(folder_results))
        {
            folder.first_data_block_offset = result.0;
            folder.num_data_blocks = result.1;
            folder.compression_type = ctype;
            folder.blocks = BlockState::Unread;
            for (file, offset) in folder.files.iter_mut().zip(offsets) {
                file.uncompressed_offset = offset;
                file.folder_index = folder_index as u16;
                file.source_path = None;
            }
        }
        self.reader = Some(File::open(&self.path)?);
        debug!(
            path = %self.path.display(),
            size = total_size,
            "saved cabinet"
        );
        Ok(())
    }
}

fn parse_cabinet<R: Read + Seek>(reader: &mut R) -> Result<CabinetStructure> {
    let signature = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    if signature != consts::FILE_SIGNATURE {
        return Err(CabError::unsupported(
            "not a cabinet file (invalid file signature)",
        ));
    }
    let _reserved1 = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let total_size = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    if total_size > consts::MAX_TOTAL_CAB_SIZE {
        return Err(CabError::unsupported(format!(
            "cabinet total size field is too large \
             ({} bytes; max is {} bytes)",
            total_size,
            consts::MAX_TOTAL_CAB_SIZE
        )));
    }
    let _reserved2 = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let first_file_offset = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let _reserved3 = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let minor_version =
        reader.read_u8().map_err(|e| truncated(e, "cabinet header"))?;
    let major_version =
        reader.read_u8().map_err(|e| truncated(e, "cabinet header"))?;
    if major_version != consts::VERSION_MAJOR
        || minor_version != consts::VERSION_MINOR
    {
        return Err(CabError::unsupported(format!(
            "version {}.{} cabinet files are not supported",
            major_version, minor_version
        )));
    }
    let num_folders = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?
        as usize;
    let num_files = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let flags = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let cabinet_set_id = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let cabinet_set_index = reader
        .read_u16::<LittleEndian>()
        .map_err(|e| truncated(e, "cabinet header"))?;
    let mut header_reserve_size = 0u16;
    let mut folder_reserve_size = 0u8;
    let mut data_reserve_size = 0u8;
    if (flags & consts::FLAG_RESERVE_PRESENT) != 0 {
        header_reserve_size = reader
            .read_u16::<LittleEndian>()
            .map_err(|e| truncated(e, "cabinet header"))?;
        folder_reserve_size =
            reader.read_u8().map_err(|e| truncated(e, "cabinet header"))?;
        data_reserve_size =
            reader.read_u8().map_err(|e| truncated(e, "cabinet header"))?;
        if header_reserve_size as usize > consts::MAX_HEADER_RESERVE_SIZE {
            return Err(CabError::unsupported(format!(
                "cabinet reserve data is too large \
                 ({} bytes; max is {} bytes)",
                header_reserve_size,
                consts::MAX_HEADER_RESERVE_SIZE
            )));
        }
    }
    let mut header_reserve_data = vec![0u8; header_reserve_size as usize];
    if header_reserve_size > 0 {
        reader
            .read_exact(&mut header_reserve_data)
            .map_err(|e| truncated(e, "cabinet header"))?;
    }
    let prev_cabinet = if (flags & consts::FLAG_PREV_CABINET) != 0 {
        let cab_name = read_null_terminated_string(reader, false)?;
        let disk_name = read_null_terminated_string(reader, false)?;
        Some((cab_name, disk_name))
    } else {
        None
    };
    if (flags & consts::FLAG_NEXT_CABINET) != 0 {
        let cab_name = read_null_terminated_string(reader, false)?;
        let _disk_name = read_null_terminated_string(reader, false)?;
        return Err(CabError::MultiCabinetUnsupported {
            next_cabinet: cab_name,
        });
    }
    let mut folders = Vec::with_capacity(num_folders);
    for _ in 0..num_folders {
        let entry =
            parse_folder_entry(reader, folder_reserve_size as usize)?;
        folders.push(entry);
    }
    reader.seek(SeekFrom::Start(first_file_offset as u64))?;
    for _ in 0..num_files {
        let entry = parse_file_entry(reader)?;
        let folder_index = match entry.folder_index {
            consts::IFOLD_CONTINUED_FROM_PREV if !folders.is_empty() => {
                // The entry's bytes begin in the previous cabinet of the
                // set; keep the record (with its sentinel index verbatim)
                // attached to the folder its tail lands in.
                warn!(
                    name = entry.name.as_str(),
                    "file is continued from a previous cabinet"
                );
                0
            }
            index if (index as usize) < folders.len() => index as usize,
            consts::IFOLD_CONTINUED_TO_NEXT
            | consts::IFOLD_CONTINUED_PREV_AND_NEXT => {
                // Only legal alongside the next-cabinet flag, which was
                // rejected above.
                return Err(CabError::unsupported(format!(
                    "file {:?} is continued into the next cabinet",
                    entry.name
                )));
            }
            index => {
                return Err(CabError::unsupported(format!(
                    "file entry folder index {} out of bounds",
                    index
                )));
            }
        };
        folders[folder_index].files.push(entry);
    }
    Ok(CabinetStructure {
        cabinet_set_id,
        cabinet_set_index,
        header_reserve_data,
        folder_reserve_size,
        data_reserve_size,
        prev_cabinet,
        folders,
    })
}

/// Applies the entry's last-write time and read-only attribute to a freshly
/// extracted file.
fn apply_file_metadata(dest: &File, file: &FileEntry) -> Result<()> {
    if let Some(datetime) = file.datetime() {
        let timestamp = SystemTime::from(datetime.assume_utc());
        dest.set_modified(timestamp)?;
    }
    if file.is_read_only() {
        let mut permissions = dest.metadata()?.permissions();
        permissions.set_readonly(true);
        dest.set_permissions(permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::parse_cabinet;
    use crate::error::CabError;

    #[test]
    fn parse_uncompressed_cabinet_with_one_file() {
        let binary: &[u8] = b"MSCF\0\0\0\0\x59\0\0\0\0\0\0\0\
            \x2c\0\0\0\0\0\0\0\x03\x01\x01\0\x01\0\0\0\x34\x12\0\0\
            \x43\0\0\0\x01\0\0\0\
            \x0e\0\0\0\0\0\0\0\0\0\x6c\x22\xba\x59\x01\0hi.txt\0\
            \x4c\x1a\x2e\x7f\x0e\0\x0e\0Hello, world!\n";
        assert_eq!(binary.len(), 0x59);
        let structure = parse_cabinet(&mut Cursor::new(binary)).unwrap();
        assert_eq!(structure.cabinet_set_id, 0x1234);
        assert_eq!(structure.cabinet_set_index, 0);
        assert_eq!(structure.header_reserve_data, b"");
        assert_eq!(structure.folders.len(), 1);
        assert_eq!(structure.folders[0].files.len(), 1);
        let file = &structure.folders[0].files[0];
        assert_eq!(file.name(), "hi.txt");
        assert_eq!(file.uncompressed_size(), 14);
        assert!(file.is_read_only());
    }

    #[test]
    fn parse_cabinet_with_two_files_in_one_folder() {
        let binary: &[u8] = b"MSCF\0\0\0\0\x80\0\0\0\0\0\0\0\
            \x2c\0\0\0\0\0\0\0\x03\x01\x01\0\x02\0\0\0\x34\x12\0\0\
            \x5b\0\0\0\x01\0\0\0\
            \x0e\0\0\0\0\0\0\0\0\0\x6c\x22\xe7\x59\x01\0hi.txt\0\
            \x0f\0\0\0\x0e\0\0\0\0\0\x6c\x22\xe7\x59\x01\0bye.txt\0\
            \0\0\0\0\x1d\0\x1d\0Hello, world!\nSee you later!\n";
        assert_eq!(binary.len(), 0x80);
        let structure = parse_cabinet(&mut Cursor::new(binary)).unwrap();
        assert_eq!(structure.folders.len(), 1);
        let names: Vec<&str> = structure.folders[0]
            .files
            .iter()
            .map(|file| file.name())
            .collect();
        assert_eq!(names, vec!["hi.txt", "bye.txt"]);
        assert_eq!(structure.folders[0].files[1].uncompressed_offset, 14);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let binary: &[u8] = b"ABCD\0\0\0\0\x59\0\0\0\0\0\0\0\
            \x2c\0\0\0\0\0\0\0\x03\x01\x01\0\x01\0\0\0\x34\x12\0\0";
        let err = parse_cabinet(&mut Cursor::new(binary)).unwrap_err();
        assert!(matches!(err, CabError::UnsupportedFormat { .. }));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let binary: &[u8] = b"MSCF\0\0\0\0\x59\0\0\0\0\0\0\0\
            \x2c\0\0\0\0\0\0\0\x04\x01\x01\0\x01\0\0\0\x34\x12\0\0\
            \x43\0\0\0\x01\0\0\0";
        let err = parse_cabinet(&mut Cursor::new(binary)).unwrap_err();
        assert!(matches!(err, CabError::UnsupportedFormat { .. }));
    }

    #[test]
    fn next_cabinet_chain_is_rejected() {
        // Flags 0x0002 with the next-cabinet name pair after the header.
        let binary: &[u8] = b"MSCF\0\0\0\0\x6b\0\0\0\0\0\0\0\
            \x3e\0\0\0\0\0\0\0\x03\x01\x01\0\x01\0\x02\0\x34\x12\0\0\
            next.cab\0disk two\0\
            \x55\0\0\0\x01\0\0\0";
        let err = parse_cabinet(&mut Cursor::new(binary)).unwrap_err();
        match err {
            CabError::MultiCabinetUnsupported { next_cabinet } => {
                assert_eq!(next_cabinet, "next.cab");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn truncated_header_is_reported() {
        let binary: &[u8] = b"MSCF\0\0\0\0\x59\0\0";
        let err = parse_cabinet(&mut Cursor::new(binary)).unwrap_err();
        assert!(matches!(
            err,
            CabError::TruncatedStream("cabinet header")
        ));
    }

    #[test]
    fn file_folder_index_is_bounds_checked() {
        // One folder, but the file claims folder 2.
        let binary: &[u8] = b"MSCF\0\0\0\0\x59\0\0\0\0\0\0\0\
            \x2c\0\0\0\0\0\0\0\x03\x01\x01\0\x01\0\0\0\x34\x12\0\0\
            \x43\0\0\0\x01\0\0\0\
            \x0e\0\0\0\0\0\0\0\x02\0\x6c\x22\xba\x59\x01\0hi.txt\0\
            \x4c\x1a\x2e\x7f\x0e\0\x0e\0Hello, world!\n";
        let err = parse_cabinet(&mut Cursor::new(binary)).unwrap_err();
        assert!(matches!(err, CabError::UnsupportedFormat { .. }));
    }

    #[test]
    fn reserve_areas_are_parsed() {
        // Reserve-present flag with a 4-byte header reserve area and
        // per-folder/per-block reserve sizes of zero.
        let binary: &[u8] = b"MSCF\0\0\0\0\x61\0\0\0\0\0\0\0\
            \x34\0\0\0\0\0\0\0\x03\x01\x01\0\x01\0\x04\0\x34\x12\0\0\
            \x04\0\0\0abcd\
            \x4b\0\0\0\x01\0\0\0\
            \x0e\0\0\0\0\0\0\0\0\0\x6c\x22\xba\x59\x01\0hi.txt\0\
            \x4c\x1a\x2e\x7f\x0e\0\x0e\0Hello, world!\n";
        let structure = parse_cabinet(&mut Cursor::new(binary)).unwrap();
        assert_eq!(structure.header_reserve_data, b"abcd");
        assert_eq!(structure.folder_reserve_size, 0);
        assert_eq!(structure.data_reserve_size, 0);
        assert_eq!(structure.folders[0].files.len(), 1);
    }
}
