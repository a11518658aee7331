use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ctype::CompressionType;

/// The error type for cabinet operations.
#[derive(Debug, Error)]
pub enum CabError {
    /// I/O error from the underlying reader or writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The input is not a cabinet this library can read.
    #[error("unsupported cabinet: {reason}")]
    UnsupportedFormat {
        /// What made the input unreadable.
        reason: String,
    },

    /// The cabinet is part of a multi-cabinet set.
    #[error(
        "cabinet continues into {next_cabinet:?}; \
         multi-cabinet sets are not supported"
    )]
    MultiCabinetUnsupported {
        /// Name of the next cabinet in the set.
        next_cabinet: String,
    },

    /// A folder declares a compression scheme this library cannot handle.
    #[error("folder {folder_index} uses {ctype:?} compression, which is not supported")]
    UnsupportedCompression {
        /// Index of the folder within the cabinet.
        folder_index: usize,
        /// The declared compression scheme.
        ctype: CompressionType,
    },

    /// The stream ended before a record was complete.
    #[error("unexpected end of stream while reading {0}")]
    TruncatedStream(&'static str),

    /// A data block's decompressed length disagrees with its header.
    #[error("data block {block_index} decompressed to {actual} bytes (header says {expected})")]
    CorruptedData {
        /// Index of the block within its folder.
        block_index: usize,
        /// Uncompressed length declared by the block header.
        expected: usize,
        /// Length the decompressor actually produced.
        actual: usize,
    },

    /// A file name cannot be encoded within the format's 255-byte limit.
    #[error("file name {name:?} is too long ({length} bytes; max is 255)")]
    NameTooLong {
        /// The offending name.
        name: String,
        /// Its encoded length in bytes, without the terminator.
        length: usize,
    },

    /// The rewritten cabinet would exceed the format's 2 GiB limit.
    #[error("cabinet is too large ({size} bytes; max is 2147483647 bytes)")]
    CabinetTooLarge {
        /// The size the cabinet would have had.
        size: u64,
    },

    /// An external file is too large to store in a cabinet.
    #[error("file {} is too large ({size} bytes; max is 2147450880 bytes)", .path.display())]
    FileTooLarge {
        /// Path of the external file.
        path: PathBuf,
        /// Its size in bytes.
        size: u64,
    },

    /// The cabinet already holds the maximum number of files.
    #[error("cabinet already holds the maximum of 65535 files")]
    TooManyFiles,

    /// A folder's data would not fit in the maximum number of data blocks.
    #[error("folder would need more than 65535 data blocks")]
    TooManyDataBlocks,

    /// The external source for a pending file has gone missing.
    #[error("source file {} for {name:?} is missing", .path.display())]
    MissingSource {
        /// Relative path of the entry within the cabinet.
        name: String,
        /// Host path the bytes were supposed to come from.
        path: PathBuf,
    },

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation on a cabinet failed; carries the cabinet's path.
    #[error("cabinet {}: {source}", .path.display())]
    CabinetFailure {
        /// Path of the cabinet the operation was working on.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: Box<CabError>,
    },
}

/// The result type for cabinet operations.
pub type Result<T> = std::result::Result<T, CabError>;

impl CabError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> CabError {
        CabError::UnsupportedFormat { reason: reason.into() }
    }

    /// Attaches the cabinet path, leaving cancellation untouched.
    pub(crate) fn wrap(self, path: &Path) -> CabError {
        match self {
            CabError::Cancelled => CabError::Cancelled,
            other => CabError::CabinetFailure {
                path: path.to_path_buf(),
                source: Box::new(other),
            },
        }
    }
}

/// Maps a short read to `TruncatedStream`, passing other I/O errors through.
pub(crate) fn truncated(err: io::Error, what: &'static str) -> CabError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        CabError::TruncatedStream(what)
    } else {
        CabError::Io(err)
    }
}
