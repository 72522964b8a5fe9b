//! Upload sequencer: one chunk of one file in flight at a time.
//!
//! State is the active file, the chunk cursor within it, and the last file
//! that reached a terminal state. Transitions:
//!
//! - `enqueue` while idle activates file `last_finished + 1` at chunk 0.
//! - `next_request` reads the byte range for the cursor.
//! - `acknowledge` advances the cursor, or on the terminal reply records the
//!   final filename and activates the next file.
//! - `fail_current` marks the active file failed and moves on.
//!
//! `run` drives these against a `ChunkTransport`, wrapping every request in
//! the retry policy so a dead server surfaces as failed tasks instead of a
//! frozen queue.

use crate::{
    client::{
        retry::RetryPolicy,
        task::{TaskStatus, UploadTask},
        transport::{ChunkRequest, ChunkTransport, TransferError},
    },
    models::chunk::{Acknowledgment, ChunkParams, OpenSessionRequest},
    wire::DEFAULT_CHUNK_SIZE,
};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    /// Ask the receiver for a session token before chunk 0 of each file.
    pub use_sessions: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            use_sessions: true,
        }
    }
}

pub struct UploadSequencer<T> {
    transport: T,
    config: SequencerConfig,
    tasks: Vec<UploadTask>,
    current_file: Option<usize>,
    current_chunk: Option<u64>,
    last_finished: Option<usize>,
    session: Option<String>,
}

impl<T: ChunkTransport> UploadSequencer<T> {
    pub fn new(transport: T, mut config: SequencerConfig) -> Self {
        config.chunk_size = config.chunk_size.max(1);
        Self {
            transport,
            config,
            tasks: Vec::new(),
            current_file: None,
            current_chunk: None,
            last_finished: None,
            session: None,
        }
    }

    pub fn tasks(&self) -> &[UploadTask] {
        &self.tasks
    }

    pub fn current_file(&self) -> Option<usize> {
        self.current_file
    }

    pub fn current_chunk(&self) -> Option<u64> {
        self.current_chunk
    }

    pub fn last_finished(&self) -> Option<usize> {
        self.last_finished
    }

    pub fn is_idle(&self) -> bool {
        self.current_file.is_none()
    }

    /// Queue a file; starts it immediately when nothing is active.
    pub fn enqueue(&mut self, task: UploadTask) {
        self.tasks.push(task);
        self.activate_next();
    }

    fn activate_next(&mut self) {
        if self.current_file.is_some() {
            return;
        }
        let next = self.last_finished.map_or(0, |i| i + 1);
        if next >= self.tasks.len() {
            return;
        }

        self.current_file = Some(next);
        self.current_chunk = Some(0);
        self.session = None;
        self.tasks[next].status = TaskStatus::Uploading { chunk_index: 0 };
        debug!(file = %self.tasks[next].name, index = next, "activated file");
    }

    /// Build the request for the current cursor, if a file is active.
    pub fn next_request(&self) -> Option<ChunkRequest> {
        let task = &self.tasks[self.current_file?];
        let index = self.current_chunk?;
        let chunk_size = self.config.chunk_size;

        Some(ChunkRequest {
            params: ChunkParams {
                name: task.name.clone(),
                size: Some(task.size),
                current_chunk_index: index,
                total_chunks: task.total_chunks(chunk_size),
                session: self.session.clone(),
            },
            payload: task.chunk(index, chunk_size),
        })
    }

    /// Apply the receiver's reply to the in-flight chunk.
    ///
    /// A reply whose shape does not match the chunk (terminal for an
    /// intermediate chunk or the reverse) is a protocol violation and leaves
    /// the state untouched.
    pub fn acknowledge(&mut self, ack: Acknowledgment) -> Result<(), TransferError> {
        let (Some(file), Some(index)) = (self.current_file, self.current_chunk) else {
            return Err(TransferError::Protocol(
                "acknowledgment received while idle".into(),
            ));
        };
        let total = self.tasks[file].total_chunks(self.config.chunk_size);
        let is_last = index + 1 == total;

        match (ack, is_last) {
            (Acknowledgment::Continuation(_), false) => {
                let next = index + 1;
                self.current_chunk = Some(next);
                self.tasks[file].status = TaskStatus::Uploading { chunk_index: next };
                Ok(())
            }
            (Acknowledgment::Terminal { final_filename }, true) => {
                let task = &mut self.tasks[file];
                info!(
                    file = %task.name,
                    final_filename = %final_filename,
                    bytes = task.size,
                    "upload complete"
                );
                task.final_filename = Some(final_filename);
                task.status = TaskStatus::Completed;
                self.finish_current(file);
                Ok(())
            }
            (Acknowledgment::Terminal { final_filename }, false) => Err(TransferError::Protocol(
                format!(
                    "chunk {} of {} answered with final filename `{}`",
                    index, total, final_filename
                ),
            )),
            (Acknowledgment::Continuation(_), true) => Err(TransferError::Protocol(format!(
                "last chunk {} answered without a final filename",
                index
            ))),
        }
    }

    /// Mark the active file as failed and move on to the next one.
    pub fn fail_current(&mut self, reason: impl Into<String>) {
        let Some(file) = self.current_file else {
            return;
        };
        let chunk_index = self.current_chunk.unwrap_or(0);
        let reason = reason.into();
        error!(file = %self.tasks[file].name, chunk_index, "upload failed: {}", reason);
        self.tasks[file].status = TaskStatus::Failed {
            chunk_index,
            reason,
        };
        self.finish_current(file);
    }

    fn finish_current(&mut self, file: usize) {
        self.last_finished = Some(file);
        self.current_chunk = None;
        self.current_file = None;
        self.session = None;
        self.activate_next();
    }

    /// Drive the queue until every queued file is completed or failed.
    pub async fn run(&mut self) {
        while let Some(file) = self.current_file {
            if self.config.use_sessions && self.session.is_none() {
                let task = &self.tasks[file];
                let open = OpenSessionRequest {
                    name: task.name.clone(),
                    size: Some(task.size),
                    total_chunks: task.total_chunks(self.config.chunk_size),
                };
                let transport = &self.transport;
                let open = &open;
                let opened = self
                    .config
                    .retry
                    .run("open session", move || transport.open_session(open))
                    .await;
                match opened {
                    Ok(token) => self.session = Some(token),
                    Err(err) => {
                        self.fail_current(err.to_string());
                        continue;
                    }
                }
            }

            let Some(request) = self.next_request() else {
                break;
            };
            let transport = &self.transport;
            let request = &request;
            let what = format!(
                "chunk {}/{} of {}",
                request.params.current_chunk_index + 1,
                request.params.total_chunks,
                request.params.name
            );
            let outcome = self
                .config
                .retry
                .run(&what, move || transport.send_chunk(request))
                .await;

            let applied = outcome.and_then(|ack| self.acknowledge(ack));
            if let Err(err) = applied {
                self.fail_current(err.to_string());
            }
        }
    }
}
