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

//! Per-request state assembled from the record streams.
//!
//! A request is created when `BEGIN_REQUEST` arrives and accumulates the
//! `PARAMS` and `STDIN` streams until both are closed by their
//! zero-length records. The parameter block is parsed only when the
//! `PARAMS` stream closes.

use crate::{error::ServerResult, meta::RequestType, params::Params};
use bytes::{BufMut, Bytes, BytesMut};

/// A FastCGI request under assembly, handed to the application handler
/// once complete.
#[derive(Debug)]
pub struct Request {
    /// Request id assigned by the web server
    id: u16,
    /// The requested role from the begin request body
    role: u16,
    /// Whether the web server asked to keep the connection open
    keep_alive: bool,
    /// Accumulated, still unparsed `PARAMS` content
    param_buf: BytesMut,
    /// Parsed parameters, populated when the `PARAMS` stream closes
    params: Params,
    /// Accumulated request body from the `STDIN` stream
    body: BytesMut,
    /// Set when the zero-length `STDIN` record arrives
    complete: bool,
}

impl Request {
    /// Creates an empty request.
    ///
    /// # Arguments
    ///
    /// * `id` - The request id from the begin request record
    /// * `role` - The role from the begin request body
    /// * `keep_alive` - The `KEEP_CONN` flag from the begin request body
    pub(crate) fn new(id: u16, role: u16, keep_alive: bool) -> Self {
        Self {
            id,
            role,
            keep_alive,
            param_buf: BytesMut::new(),
            params: Params::default(),
            body: BytesMut::new(),
            complete: false,
        }
    }

    /// Feeds one record to the request, returning `true` once the
    /// request is complete and ready for dispatch.
    ///
    /// Record types other than `PARAMS` and `STDIN` reach the assembler
    /// only in error and are ignored.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The record type
    /// * `content` - The record content
    pub(crate) fn push_record(
        &mut self, r#type: &RequestType, content: Bytes,
    ) -> ServerResult<bool> {
        match r#type {
            RequestType::Params => {
                if content.is_empty() {
                    let buf = self.param_buf.split().freeze();
                    self.params = Params::parse(&buf)?;
                } else {
                    self.param_buf.put(content);
                }
            }
            RequestType::Stdin => {
                if content.is_empty() {
                    self.complete = true;
                } else {
                    self.body.put(content);
                }
            }
            _ => {}
        }
        Ok(self.complete)
    }

    /// Returns the request id assigned by the web server.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns the role requested by the web server, as the raw 16-bit
    /// value from the begin request body. Only the responder role is
    /// served.
    pub fn role(&self) -> u16 {
        self.role
    }

    /// Returns whether the web server asked to keep the connection open
    /// after this request.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns the request parameters.
    ///
    /// Empty until the `PARAMS` stream is closed.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the request body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns whether the request has received its closing `STDIN`
    /// record.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}
