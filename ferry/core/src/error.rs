// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Ferry error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
};

use futures::channel::oneshot::Canceled;

/// Result type alias for Ferry operations.
pub type Result<T> = result::Result<T, FerryError>;

/// Errors raised by the block pool, the channel multiplexer and the reduce stages.
#[derive(Debug)]
pub enum FerryError {
    /// An allocation could not be satisfied even after evicting every
    /// evictable block: (requested bytes, description).
    OutOfMemory(usize, String),
    /// Reading an evicted block back from external storage failed:
    /// (block id, description). The block stays swapped out; pinning may be retried.
    PinFailed(u64, String),
    /// Send after close or duplicate close on a channel edge:
    /// (channel id, sender, receiver, description).
    ChannelProtocolViolation(u64, usize, usize, String),
    /// Writing a partition (flush or spill) failed: (partition id, cause).
    PartitionWriteFailure(usize, Box<FerryError>),
    /// General error with a descriptive message.
    General(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// I/O operation error.
    IoError(io::Error),
    /// Record (de)serialization error.
    Serialization(String),
    /// The runtime or the peer went away while the operation was waiting.
    Cancelled,
}

#[allow(clippy::from_over_into)]
impl<T> Into<Result<T>> for FerryError {
    fn into(self) -> Result<T> {
        Err(self)
    }
}

impl FerryError {
    /// Returns true if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FerryError::PinFailed(..) | FerryError::IoError(_))
    }

    /// Copies an error for delivery to several waiters of the same operation.
    pub(crate) fn clone_for_waiter(&self) -> FerryError {
        match self {
            FerryError::OutOfMemory(size, desc) => FerryError::OutOfMemory(*size, desc.clone()),
            FerryError::PinFailed(id, desc) => FerryError::PinFailed(*id, desc.clone()),
            FerryError::ChannelProtocolViolation(channel, sender, receiver, desc) => {
                FerryError::ChannelProtocolViolation(*channel, *sender, *receiver, desc.clone())
            }
            FerryError::Cancelled => FerryError::Cancelled,
            other => FerryError::General(other.to_string()),
        }
    }
}

impl From<String> for FerryError {
    fn from(e: String) -> Self {
        FerryError::General(e)
    }
}

impl From<io::Error> for FerryError {
    fn from(e: io::Error) -> Self {
        FerryError::IoError(e)
    }
}

impl From<bincode::Error> for FerryError {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(e) => FerryError::IoError(e),
            other => FerryError::Serialization(other.to_string()),
        }
    }
}

impl From<Canceled> for FerryError {
    fn from(_: Canceled) -> Self {
        FerryError::Cancelled
    }
}

impl From<tokio::task::JoinError> for FerryError {
    fn from(e: tokio::task::JoinError) -> Self {
        FerryError::Internal(format!("Tokio join error: {e}"))
    }
}

impl Display for FerryError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FerryError::OutOfMemory(requested, desc) => {
                write!(f, "Out of memory allocating {requested} bytes: {desc}")
            }
            FerryError::PinFailed(block_id, desc) => {
                write!(f, "Failed to pin block {block_id}: {desc}")
            }
            FerryError::ChannelProtocolViolation(channel, sender, receiver, desc) => {
                write!(
                    f,
                    "Channel protocol violation on channel {channel}, \
                edge {sender} -> {receiver}: {desc}"
                )
            }
            FerryError::PartitionWriteFailure(partition, cause) => {
                write!(f, "Failed to write partition {partition}: {cause}")
            }
            FerryError::General(desc) => write!(f, "General error: {desc}"),
            FerryError::Internal(desc) => {
                write!(f, "Internal Ferry error: {desc}")
            }
            FerryError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            FerryError::IoError(desc) => write!(f, "IO error: {desc}"),
            FerryError::Serialization(desc) => {
                write!(f, "Serialization error: {desc}")
            }
            FerryError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl Error for FerryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FerryError::IoError(e) => Some(e),
            FerryError::PartitionWriteFailure(_, cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bincode_io_errors_become_io_errors() {
        let err: FerryError = Box::new(bincode::ErrorKind::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "eof",
        )))
        .into();
        assert!(matches!(err, FerryError::IoError(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn partition_write_failure_keeps_cause() {
        let err = FerryError::PartitionWriteFailure(
            3,
            Box::new(FerryError::IoError(io::Error::other("disk full"))),
        );
        assert!(err.to_string().contains("partition 3"));
        assert!(err.source().is_some());
        assert!(!err.is_retryable());
    }
}
