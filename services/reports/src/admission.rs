//! Upload admission: decompression, memory budgeting and deadline checks.
//!
//! An uploaded recording is admitted for analysis only if it fits the
//! memory budget after transparent decompression, and only if the request
//! deadline has not already been consumed by upload handling. Decompression
//! latency counts against the request budget, so the deadline is re-checked
//! after it.

use crate::error::ReportError;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, info};

/// Wall-clock budget for one request, measured from request arrival
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    started: Instant,
    total: Duration,
}

impl TimeBudget {
    /// Start a budget of `total` now
    pub fn start(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    /// Time consumed so far
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline, zero once exhausted
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    /// Whether the deadline has passed
    pub fn exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Instant the budget started
    pub fn started_at(&self) -> Instant {
        self.started
    }
}

/// An uploaded recording file owned exclusively by one request
#[derive(Debug, Clone)]
pub struct UploadedRecording {
    /// Temp file holding the recording bytes
    pub path: PathBuf,
    /// Client-supplied file name, for logging only
    pub display_name: String,
    /// Size of the file at `path`
    pub size_bytes: u64,
    /// Whether `path` holds a recognized compressed container
    pub is_compressed: bool,
}

impl UploadedRecording {
    /// Inspect a freshly written upload
    pub fn examine(path: PathBuf, display_name: String) -> io::Result<Self> {
        let size_bytes = std::fs::metadata(&path)?.len();
        let is_compressed = is_gzip(&path)?;
        Ok(Self {
            path,
            display_name,
            size_bytes,
            is_compressed,
        })
    }
}

/// Gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        // Shorter than the magic: certainly not compressed
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Source of the available-memory estimate, replaceable in tests
type MemoryProbe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Admits or rejects uploaded recordings against memory and time budgets
pub struct UploadAdmission {
    memory_factor: u64,
    probe: MemoryProbe,
    temp_dir: PathBuf,
}

impl UploadAdmission {
    /// Admission gate dividing available system memory by `memory_factor`
    pub fn new(memory_factor: u64) -> Self {
        Self::with_probe(memory_factor, Box::new(available_memory))
    }

    /// Admission gate with a custom memory probe
    pub fn with_probe(memory_factor: u64, probe: MemoryProbe) -> Self {
        Self {
            memory_factor: memory_factor.max(1),
            probe,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Write decompressed recordings into `dir` instead of the system
    /// temp directory
    pub fn in_temp_dir(mut self, dir: &Path) -> Self {
        self.temp_dir = dir.to_path_buf();
        self
    }

    /// Largest upload currently handleable
    pub fn max_handleable_size(&self) -> u64 {
        (self.probe)() / self.memory_factor
    }

    /// Admit an uploaded recording for analysis.
    ///
    /// Decompresses gzip uploads to a fresh temp file, deleting the original
    /// immediately. Returns the admitted recording and the budget remaining
    /// for the generation phase.
    pub async fn admit(
        &self,
        recording: UploadedRecording,
        budget: &TimeBudget,
    ) -> Result<(UploadedRecording, Duration), ReportError> {
        let replaced = recording.is_compressed;
        let recording = if recording.is_compressed {
            let display_name = recording.display_name.clone();
            let src = recording.path.clone();
            let dir = self.temp_dir.clone();
            let decompress_started = Instant::now();
            let (path, size_bytes) =
                tokio::task::spawn_blocking(move || decompress(&src, &dir))
                    .await
                    .map_err(|e| {
                        ReportError::Io(io::Error::new(io::ErrorKind::Other, e))
                    })??;
            info!(
                file = %display_name,
                decompressed_bytes = size_bytes,
                elapsed_ms = decompress_started.elapsed().as_millis() as u64,
                "Decompressed uploaded recording"
            );
            metrics::counter!("reports.uploads.decompressed").increment(1);
            UploadedRecording {
                path,
                display_name,
                size_bytes,
                is_compressed: false,
            }
        } else {
            recording
        };

        let ceiling = self.max_handleable_size();
        debug!(
            size_bytes = recording.size_bytes,
            ceiling_bytes = ceiling,
            "Checking recording against memory budget"
        );
        if recording.size_bytes > ceiling {
            metrics::counter!("reports.uploads.rejected_size").increment(1);
            // The caller's guard only learns of the decompressed
            // replacement once admission succeeds; on rejection it is
            // ours to remove.
            if replaced {
                let _ = std::fs::remove_file(&recording.path);
            }
            return Err(ReportError::PayloadTooLarge {
                size_bytes: recording.size_bytes,
                ceiling_bytes: ceiling,
            });
        }

        // Decompression may have consumed the whole budget
        if budget.exhausted() {
            if replaced {
                let _ = std::fs::remove_file(&recording.path);
            }
            return Err(ReportError::DeadlineExceeded);
        }

        Ok((recording, budget.remaining()))
    }
}

/// Decompress a gzip file into a fresh temp file, removing the source
fn decompress(src: &Path, dir: &Path) -> Result<(PathBuf, u64), ReportError> {
    let result = (|| {
        let tmp = tempfile::Builder::new()
            .prefix("reports-")
            .suffix(".jfr")
            .tempfile_in(dir)?;
        let (file, path) = tmp.keep().map_err(|e| e.error)?;

        let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
        let mut writer = BufWriter::new(file);
        let size_bytes = match io::copy(&mut decoder, &mut writer) {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        Ok((path, size_bytes))
    })();
    // The original is replaced by the decompressed file on success and
    // useless on failure; drop it either way.
    let _ = std::fs::remove_file(src);
    result.map_err(ReportError::Io)
}

/// Estimate of memory currently available to this process
fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory()
}
