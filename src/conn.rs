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

//! Per-connection record dispatch.
//!
//! One [`Connection`] drives one accepted socket: it pulls complete
//! records off the stream, routes them to the request they belong to,
//! fires the application handler when a request completes and honours
//! the `KEEP_CONN` flag afterwards.

use crate::{
    error::{ServerError, ServerResult},
    meta::{BeginRequestRec, Header, ParamPair, RequestType, Role, encode_name_value_pairs},
    request::Request,
    response::Response,
    server::Handler,
};
use bytes::Bytes;
use std::{collections::HashMap, io::ErrorKind, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, warn};

/// Default per-read timeout on a connection.
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(5000);

/// Management variables advertised in response to `GET_VALUES`.
const GET_VALUES_RESULT: [(&[u8], &[u8]); 3] = [
    (b"FCGI_MAX_CONNS", b"1"),
    (b"FCGI_MAX_REQS", b"1"),
    (b"FCGI_MPXS_CONNS", b"0"),
];

/// Driver for a single accepted connection.
///
/// Owns the socket's byte stream and the set of requests currently
/// assembling on it, keyed by request id.
pub struct Connection<S, H> {
    stream: S,
    handler: Arc<H>,
    requests: HashMap<u16, Request>,
    read_timeout: Duration,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: Handler,
{
    /// Creates a driver for an accepted stream, such as a
    /// `tokio::net::TcpStream`.
    ///
    /// # Arguments
    ///
    /// * `stream` - The accepted byte stream
    /// * `handler` - The application handler
    /// * `read_timeout` - Bound on each record read
    pub fn new(stream: S, handler: Arc<H>, read_timeout: Duration) -> Self {
        Self {
            stream,
            handler,
            requests: HashMap::new(),
            read_timeout,
        }
    }

    /// Drives the connection until the peer closes it, a completed
    /// non-keep-alive request is flushed, or the stream fails.
    pub async fn run(mut self) -> ServerResult<()> {
        loop {
            let Some((header, content)) = self.read_record().await? else {
                debug!("Peer closed the connection.");
                return Ok(());
            };
            debug!(id = header.request_id, ?header, "Receive from stream.");

            match header.r#type {
                RequestType::BeginRequest => self.begin_request(header, &content)?,
                RequestType::AbortRequest | RequestType::EndRequest => {
                    debug!(id = header.request_id, "Request dropped by peer.");
                    self.requests.remove(&header.request_id);
                }
                RequestType::Params | RequestType::Stdin => {
                    if self.stream_record(header, content).await? {
                        return Ok(());
                    }
                }
                RequestType::GetValues => {
                    self.get_values().await?;
                    return Ok(());
                }
                record_type => {
                    debug!(id = header.request_id, %record_type, "Discard unsupported record.");
                }
            }
        }
    }

    /// Reads one complete record, bounding the read with the configured
    /// timeout. Returns `None` when the peer closed the connection
    /// between records.
    async fn read_record(&mut self) -> ServerResult<Option<(Header, Bytes)>> {
        let read = async {
            let header = match Header::new_from_stream(&mut self.stream).await {
                Ok(header) => header,
                Err(ServerError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let content = header.read_content_from_stream(&mut self.stream).await?;
            Ok(Some((header, content)))
        };

        match timeout(self.read_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::ReadTimeout {
                timeout_ms: self.read_timeout.as_millis() as u64,
            }),
        }
    }

    /// Opens a request. A duplicate begin request for an id discards
    /// the request assembled so far and starts over.
    fn begin_request(&mut self, header: Header, content: &[u8]) -> ServerResult<()> {
        let id = header.request_id;
        let rec = BeginRequestRec::new_from_content(header, content)?;
        let begin_request = &rec.begin_request;
        debug!(
            id,
            role = begin_request.role,
            known_role = ?Role::from_u16(begin_request.role),
            keep_alive = begin_request.keep_alive(),
            "Begin request."
        );

        if self.requests.remove(&id).is_some() {
            warn!(id, "Duplicate begin request, discarding previous request.");
        }

        let request = Request::new(id, begin_request.role, begin_request.keep_alive());
        self.handler.on_request_incoming(&request);
        self.requests.insert(id, request);
        Ok(())
    }

    /// Feeds a `PARAMS`/`STDIN` record to its request, dispatching the
    /// handler on completion. Returns `true` when the connection should
    /// close.
    async fn stream_record(&mut self, header: Header, content: Bytes) -> ServerResult<bool> {
        let id = header.request_id;
        let Some(request) = self.requests.get_mut(&id) else {
            debug!(id, "Record for unknown request id, discarding.");
            return Ok(false);
        };

        match request.push_record(&header.r#type, content) {
            Ok(true) => {
                let keep_alive = self.dispatch(id).await?;
                Ok(!keep_alive)
            }
            Ok(false) => Ok(false),
            Err(error) => {
                // The protocol has no parse-error status; answer with an
                // empty body and a normal end request.
                warn!(id, %error, "Request failed, ending with empty response.");
                let keep_alive = request.keep_alive();
                self.requests.remove(&id);
                Response::new(&mut self.stream, id).flush().await?;
                Ok(!keep_alive)
            }
        }
    }

    /// Invokes the application handler for a completed request and
    /// finishes the response.
    async fn dispatch(&mut self, id: u16) -> ServerResult<bool> {
        let request = self
            .requests
            .remove(&id)
            .expect("dispatched request must exist");
        let keep_alive = request.keep_alive();
        let handler = self.handler.clone();

        let mut response = Response::new(&mut self.stream, id);
        if let Err(error) = handler.on_request_received(&request, &mut response).await {
            warn!(id, %error, "Handler failed, ending with empty response.");
        }
        if !response.is_closed() {
            response.flush().await?;
        }

        debug!(id, keep_alive, "Request finished.");
        Ok(keep_alive)
    }

    /// Answers a management `GET_VALUES` probe and closes the
    /// connection.
    async fn get_values(&mut self) -> ServerResult<()> {
        let pairs: Vec<ParamPair<'_>> = GET_VALUES_RESULT
            .iter()
            .map(|&(name, value)| ParamPair::new(name, value))
            .collect();
        let content = encode_name_value_pairs(&pairs).await?;

        debug!("Answer get values probe.");
        Header::new(RequestType::GetValuesResult, 0, &content)?
            .write_to_stream(&mut self.stream, &content)
            .await?;
        self.stream.flush().await?;
        Ok(())
    }
}
