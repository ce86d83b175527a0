//! Outbound data paths: the backoff-driven log uploader and chunked file
//! uploads.

pub mod backoff;
pub mod chunked;
pub mod logs;

pub use backoff::WaitSchedule;
pub use chunked::{chunk_ranges, ChunkedUpload, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use logs::{LogSink, LogUploader, LogUploaderParams};
