//! Buffered calls to the job controller.
//!
//! Calls are kept in order and sent one at a time. The first failure
//! stops the sync and leaves that call at the head of the queue, so every
//! call is delivered at least once and never out of order.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::controller::JobController;
use crate::error::RemoteResult;

#[derive(Debug, Clone, PartialEq)]
pub enum BufferedCall {
    Log { name: String, content: String },
    ChannelData { channel: String, rows: Vec<u8> },
    StreamInternalFile { path: String, rows: Vec<u8> },
    /// `content` is base64.
    UploadJobFile { path: String, content: String },
}

impl BufferedCall {
    async fn invoke(&self, controller: &dyn JobController) -> RemoteResult<()> {
        match self {
            BufferedCall::Log { name, content } => controller.log(name, content).await,
            BufferedCall::ChannelData { channel, rows } => controller.channel_data(channel, rows).await,
            BufferedCall::StreamInternalFile { path, rows } => controller.stream_internal_file(path, rows).await,
            BufferedCall::UploadJobFile { path, content } => controller.upload_job_file(path, content).await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            BufferedCall::Log { .. } => "log",
            BufferedCall::ChannelData { .. } => "channel_data",
            BufferedCall::StreamInternalFile { .. } => "stream_internal_file",
            BufferedCall::UploadJobFile { .. } => "upload_job_file",
        }
    }
}

#[derive(Debug, Default)]
pub struct CallQueue {
    calls: Mutex<VecDeque<BufferedCall>>,
}

impl CallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: BufferedCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push_back(call);
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> Vec<BufferedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    /// Send queued calls in order. Returns how many were delivered.
    ///
    /// Must not run concurrently with itself.
    pub async fn sync(&self, controller: &dyn JobController) -> RemoteResult<usize> {
        let mut sent = 0;
        loop {
            let Some(call) = self.calls.lock().unwrap_or_else(|e| e.into_inner()).front().cloned() else {
                break;
            };
            if let Err(e) = call.invoke(controller).await {
                warn!(call = call.kind(), sent, error = %e, "buffered call failed, keeping it queued");
                return Err(e);
            }
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "buffered calls delivered");
        }
        Ok(sent)
    }
}
