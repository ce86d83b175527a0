//! Sequential chunked upload of a local file.
//!
//! Each chunk is read straight from its byte range on disk, so memory use is
//! bounded by the chunk size regardless of the file size.

use crate::control::ControlPlane;
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Context, Result};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

pub const MAX_CHUNK_SIZE: usize = 128 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024 * 1024;

/// Half-open byte ranges covering `[0, file_size)` in `chunk_size` steps.
pub fn chunk_ranges(file_size: u64, chunk_size: usize) -> impl Iterator<Item = Range<u64>> {
    let step = chunk_size.max(1) as u64;
    (0..file_size.div_ceil(step)).map(move |index| {
        let start = index * step;
        let end = start.saturating_add(step).min(file_size);
        start..end
    })
}

pub struct ChunkedUpload {
    control: Arc<dyn ControlPlane>,
    telemetry: Arc<Telemetry>,
    path: PathBuf,
    chunk_size: usize,
    file_size: u64,
    upload_id: Option<String>,
}

impl ChunkedUpload {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        telemetry: Arc<Telemetry>,
        path: impl Into<PathBuf>,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            bail!("chunk_size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {chunk_size}");
        }

        Ok(Self {
            control,
            telemetry,
            path: path.into(),
            chunk_size,
            file_size: 0,
            upload_id: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Stats the file and asks the control plane for an upload id sized to it.
    pub async fn start(&mut self) -> Result<&str> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("failed to stat {}", self.path.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", self.path.display());
        }
        self.file_size = metadata.len();

        let upload_id = self
            .control
            .start_upload(self.file_size)
            .await
            .context("failed to start chunked upload")?;
        tracing::debug!(
            path = %self.path.display(),
            file_size = self.file_size,
            upload_id = %upload_id,
            "chunked upload session started"
        );

        Ok(self.upload_id.insert(upload_id).as_str())
    }

    /// Runs the whole session: `start()` followed by every chunk in order.
    /// The first failing chunk aborts the session.
    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn upload(mut self) -> Result<String> {
        self.start().await?;
        let upload_id = self
            .upload_id
            .clone()
            .context("upload id missing after start")?;

        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut buffer = Vec::with_capacity(self.chunk_size.min(self.file_size as usize));
        let total = self.file_size.div_ceil(self.chunk_size as u64);

        for (index, range) in chunk_ranges(self.file_size, self.chunk_size).enumerate() {
            read_range(&mut file, &range, &mut buffer)
                .await
                .with_context(|| format!("failed to read bytes {range:?} of {}", self.path.display()))?;

            self.control
                .upload_chunk(&upload_id, range.start, range.end - 1, &buffer)
                .await
                .with_context(|| format!("chunk {}/{total} failed", index + 1))?;

            self.telemetry.record_chunk_uploaded(buffer.len() as u64);
            tracing::trace!(chunk = index + 1, total, start = range.start, end = range.end, "chunk uploaded");
        }

        tracing::info!(upload_id = %upload_id, file_size = self.file_size, chunks = total, "file uploaded");
        Ok(upload_id)
    }
}

async fn read_range(file: &mut File, range: &Range<u64>, buffer: &mut Vec<u8>) -> Result<()> {
    let len = usize::try_from(range.end - range.start).context("chunk does not fit in memory")?;
    buffer.resize(len, 0);
    file.seek(SeekFrom::Start(range.start)).await?;
    file.read_exact(buffer).await?;
    Ok(())
}
