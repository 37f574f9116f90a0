// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types and result type aliases for FastCGI operations.
//!
//! This module defines the error types that can occur while serving
//! FastCGI requests and provides convenient type aliases for results.

use crate::meta::RequestType;

/// Result type alias for FastCGI responder operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error types that can occur while serving FastCGI connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Wapper of `tokio::io::Error`
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// The record stream is corrupt, the connection must be abandoned.
    #[error("Unsupported fastcgi version `{version}`, the record stream is corrupt")]
    UnsupportedVersion {
        /// The version byte found in the record header
        version: u8,
    },

    /// No complete record arrived within the connection read timeout.
    #[error("Read timed out after {timeout_ms} ms")]
    ReadTimeout {
        /// The configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// The record body is shorter than its type requires.
    #[error("Malformed record body of type `{request_type}`")]
    MalformedRecord {
        /// The type of the record with the malformed body
        request_type: RequestType,
    },

    /// The accumulated `PARAMS` stream is not a valid name/value block.
    #[error("Malformed name/value block in params stream")]
    MalformedParams,

    /// A name or value length does not fit the encoding.
    #[error("Parameter length `{length}` out of range")]
    OversizeParameter {
        /// The offending length
        length: usize,
    },

    /// Record content larger than the 16-bit length field; the emitter
    /// must chunk instead.
    #[error("Record content length `{length}` exceeds 65535")]
    OversizeRecord {
        /// The offending content length
        length: usize,
    },

    /// The listen port could not be bound.
    #[error("Port `{port}` unavailable")]
    PortUnavailable {
        /// The port that could not be bound
        port: u16,
        /// The underlying bind error
        source: tokio::io::Error,
    },

    /// Handler hooks may be replaced only while the server is stopped.
    #[error("Handlers may be set only while the server is stopped")]
    AlreadyActive,
}
