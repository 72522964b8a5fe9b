//! Client half of the protocol: the upload sequencer and its transports.
//!
//! The sequencer keeps exactly one chunk of one file in flight, advancing
//! chunk by chunk and file by file as acknowledgments arrive.

pub mod retry;
pub mod sequencer;
pub mod task;
pub mod transport;

pub use retry::RetryPolicy;
pub use sequencer::{SequencerConfig, UploadSequencer};
pub use task::{TaskStatus, UploadTask};
pub use transport::{ChunkRequest, ChunkTransport, HttpTransport, TransferError};
