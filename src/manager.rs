use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cabinet::Cabinet;
use crate::ctype::CompressionType;
use crate::error::Result;
use crate::progress::CancelToken;

/// One requested operation against a cabinet.
#[derive(Debug, Clone)]
pub struct Request {
    /// Path of the cabinet the operation targets.
    pub cabinet: PathBuf,
    /// The operation to perform.
    pub op: Operation,
    /// Set once the request has actually been carried out.  Requests whose
    /// target file does not exist in the cabinet complete without setting
    /// this.
    pub processed: bool,
}

impl Request {
    /// Creates an unprocessed request.
    pub fn new<P: Into<PathBuf>>(cabinet: P, op: Operation) -> Request {
        Request { cabinet: cabinet.into(), op, processed: false }
    }
}

/// The operations a batch can carry.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Add (or replace) a file from the host filesystem.
    Archive {
        /// Path of the source file on the host.
        source: PathBuf,
        /// Relative path within the cabinet.
        name: String,
    },
    /// Extract a file to the host filesystem.
    Extract {
        /// Relative path within the cabinet.
        name: String,
        /// Destination path on the host.
        dest: PathBuf,
    },
    /// Delete a file from the cabinet.
    Delete {
        /// Relative path within the cabinet.
        name: String,
    },
    /// Rename a file within the cabinet.
    Rename {
        /// Current relative path.
        from: String,
        /// New relative path.
        to: String,
    },
}

impl Operation {
    fn is_mutating(&self) -> bool {
        !matches!(self, Operation::Extract { .. })
    }

    fn target_name(&self) -> &str {
        match self {
            Operation::Archive { name, .. } => name,
            Operation::Extract { name, .. } => name,
            Operation::Delete { name } => name,
            Operation::Rename { from, .. } => from,
        }
    }
}

/// Progress and completion events emitted while a batch runs.
#[derive(Debug)]
pub enum Event<'a> {
    /// Bytes moved for the named file, with per-operation and cumulative
    /// totals for percentage displays.
    Progress {
        /// Cabinet being worked on.
        cabinet: &'a Path,
        /// Relative path currently being transferred.
        name: &'a str,
        /// Bytes transferred so far by the current operation.
        bytes_done: u64,
        /// Total bytes the current operation will transfer.
        bytes_total: u64,
        /// Bytes transferred so far across the whole batch.
        batch_done: u64,
    },
    /// A request finished; `processed` mirrors the request's flag.
    FileProcessed {
        /// Cabinet the request targeted.
        cabinet: &'a Path,
        /// Relative path the request named.
        name: &'a str,
        /// Whether the request actually changed or extracted anything.
        processed: bool,
    },
    /// All requests for one cabinet finished.
    CabinetCompleted {
        /// The cabinet whose group is done.
        cabinet: &'a Path,
    },
}

/// Runs batches of cabinet requests.
///
/// Requests are grouped by cabinet path in first-appearance order.  Each
/// group opens its cabinet once, runs its requests in order, saves when any
/// of them mutated the cabinet, and always ends with
/// [`Event::CabinetCompleted`], even when every request was a no-op.
/// Errors are wrapped with the failing cabinet's path; cancellation is
/// re-raised unchanged.
pub struct CabManager<'a> {
    on_event: Box<dyn FnMut(Event) + 'a>,
    cancel: CancelToken,
}

impl<'a> CabManager<'a> {
    /// Creates a manager delivering events to `on_event`.
    pub fn new<F: FnMut(Event) + 'a>(on_event: F) -> CabManager<'a> {
        CabManager { on_event: Box::new(on_event), cancel: CancelToken::new() }
    }

    /// Returns a clone of the cancellation token polled by running batches.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Processes the batch, updating each request's `processed` flag in
    /// place.
    pub fn process(&mut self, requests: &mut [Request]) -> Result<()> {
        let mut groups: Vec<(PathBuf, Vec<usize>)> = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            match groups
                .iter_mut()
                .find(|(path, _)| *path == request.cabinet)
            {
                Some((_, indices)) => indices.push(index),
                None => groups.push((request.cabinet.clone(), vec![index])),
            }
        }
        for (path, indices) in groups {
            self.process_cabinet(&path, &indices, requests)
                .map_err(|err| err.wrap(&path))?;
            (self.on_event)(Event::CabinetCompleted { cabinet: &path });
        }
        Ok(())
    }

    fn process_cabinet(
        &mut self,
        path: &Path,
        indices: &[usize],
        requests: &mut [Request],
    ) -> Result<()> {
        let has_archive = indices.iter().any(|&index| {
            matches!(requests[index].op, Operation::Archive { .. })
        });
        if !path.exists() && !has_archive {
            // Nothing to open and nothing that would create it.
            return Ok(());
        }
        debug!(
            path = %path.display(),
            num_requests = indices.len(),
            "processing cabinet batch"
        );
        let mut cabinet = Cabinet::open(path)?;
        let mut batch_done = 0u64;
        let mut mutated = false;
        for &index in indices {
            self.cancel.check()?;
            let request = &mut requests[index];
            let processed = match &request.op {
                Operation::Archive { source, name } => {
                    cabinet.add_external_file(source, name)?;
                    true
                }
                Operation::Extract { name, dest } => {
                    let bytes_total = cabinet
                        .get_file_entry(name)
                        .map(|file| file.uncompressed_size() as u64)
                        .unwrap_or(0);
                    let mut bytes_done = 0u64;
                    let on_event = &mut self.on_event;
                    cabinet.extract_to_file_with(
                        name,
                        dest,
                        &mut |name, chunk| {
                            bytes_done += chunk;
                            batch_done += chunk;
                            on_event(Event::Progress {
                                cabinet: path,
                                name,
                                bytes_done,
                                bytes_total,
                                batch_done,
                            });
                        },
                        &self.cancel,
                    )?
                }
                Operation::Delete { name } => cabinet.delete_file(name)?,
                Operation::Rename { from, to } => {
                    cabinet.move_file(from, to)?
                }
            };
            mutated |= processed && request.op.is_mutating();
            request.processed = processed;
            (self.on_event)(Event::FileProcessed {
                cabinet: path,
                name: request.op.target_name(),
                processed,
            });
        }
        if mutated {
            let bytes_total: u64 = cabinet
                .folder_entries()
                .map(|folder| {
                    folder
                        .file_entries()
                        .map(|file| file.uncompressed_size() as u64)
                        .sum::<u64>()
                })
                .sum();
            let mut bytes_done = 0u64;
            let on_event = &mut self.on_event;
            cabinet.save_with(
                CompressionType::None,
                &mut |name, chunk| {
                    bytes_done += chunk;
                    batch_done += chunk;
                    on_event(Event::Progress {
                        cabinet: path,
                        name,
                        bytes_done,
                        bytes_total,
                        batch_done,
                    });
                },
                &self.cancel,
            )?;
        }
        Ok(())
    }
}
