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

//! Staged HTTP response and the record emitter behind it.
//!
//! The handler mutates the staged status line and headers, then calls
//! [`Response::send`] with the body. The emitter assembles a CGI-style
//! prelude, splits the output into `STDOUT` records of at most 65535
//! bytes and terminates the response with a zero-length `STDOUT`
//! followed by a single `END_REQUEST`.

use crate::{
    error::ServerResult,
    meta::{EndRequestRec, Header, ProtocolStatus, RequestType},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Default `X-Powered-By` header value.
const POWERED_BY: &str = "MVCXE.NGINX.FCGI";

/// Response of a fastcgi request, staged for the application handler.
///
/// Holds the connection's write half for the duration of the response;
/// all records for the request id are emitted in the order they are
/// produced.
pub struct Response<'a> {
    writer: &'a mut (dyn AsyncWrite + Unpin + Send),
    request_id: u16,
    http_version: String,
    status_code: u16,
    headers: Vec<(String, String)>,
    content_type: String,
    charset: Option<String>,
    closed: bool,
}

impl<'a> Response<'a> {
    /// Creates a response staged with the defaults: `HTTP/1.1`, status
    /// 200, `X-Powered-By` and a `Content-Type` of `text/html` with the
    /// `utf-8` charset.
    ///
    /// # Arguments
    ///
    /// * `writer` - The connection's write half
    /// * `request_id` - The id of the request being answered
    pub(crate) fn new(writer: &'a mut (dyn AsyncWrite + Unpin + Send), request_id: u16) -> Self {
        let mut response = Self {
            writer,
            request_id,
            http_version: "HTTP/1.1".to_string(),
            status_code: 200,
            headers: vec![("X-Powered-By".to_string(), POWERED_BY.to_string())],
            content_type: "text/html".to_string(),
            charset: Some("utf-8".to_string()),
            closed: false,
        };
        response.compose_content_type();
        response
    }

    /// Sets the status code of the status line.
    ///
    /// # Arguments
    ///
    /// * `status_code` - The HTTP status code
    pub fn set_status(&mut self, status_code: u16) {
        self.status_code = status_code;
    }

    /// Sets the HTTP version of the status line.
    ///
    /// # Arguments
    ///
    /// * `http_version` - The version string, e.g. `HTTP/1.1`
    pub fn set_http_version(&mut self, http_version: impl Into<String>) {
        self.http_version = http_version.into();
    }

    /// Sets a header, replacing an existing one of the same name in
    /// place. Insertion order is preserved on output.
    ///
    /// # Arguments
    ///
    /// * `name` - The header name
    /// * `value` - The header value
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter().position(|(n, _)| *n == name) {
            Some(index) => self.headers[index].1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Sets the content type, recomposing the `Content-Type` header
    /// with the current charset.
    ///
    /// # Arguments
    ///
    /// * `content_type` - The media type, e.g. `text/plain`
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
        self.compose_content_type();
    }

    /// Sets the charset, rewriting the `Content-Type` header to
    /// `<type>; charset=<charset>`.
    ///
    /// # Arguments
    ///
    /// * `charset` - The charset name, e.g. `utf-8`
    pub fn set_charset(&mut self, charset: impl Into<String>) {
        self.charset = Some(charset.into());
        self.compose_content_type();
    }

    /// Returns whether the response has been sent and terminated.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn compose_content_type(&mut self) {
        let value = match &self.charset {
            Some(charset) if !self.content_type.is_empty() => {
                format!("{}; charset={}", self.content_type, charset)
            }
            _ => self.content_type.clone(),
        };
        self.set_header("Content-Type", value);
    }

    /// Sends the response: the status line, the headers in insertion
    /// order, a blank line and the body.
    ///
    /// The reason phrase is always `OK`; the upstream server rewrites
    /// the status line from the status code.
    ///
    /// # Arguments
    ///
    /// * `body` - The response body bytes
    pub async fn send(&mut self, body: &[u8]) -> ServerResult<()> {
        let mut output = Vec::with_capacity(body.len() + 128);
        output.extend_from_slice(
            format!("{} {} OK\n", self.http_version, self.status_code).as_bytes(),
        );
        for (name, value) in &self.headers {
            output.extend_from_slice(format!("{name}:{value}\n").as_bytes());
        }
        output.push(b'\n');
        output.extend_from_slice(body);

        self.send_raw(&output).await
    }

    /// Sends raw bytes as the complete `STDOUT` stream and terminates
    /// the request.
    ///
    /// The bytes are split into records of at most 65535 bytes,
    /// followed by a zero-length `STDOUT` and one `END_REQUEST` with
    /// `RequestComplete`.
    ///
    /// # Arguments
    ///
    /// * `raw` - The bytes to send
    pub async fn send_raw(&mut self, raw: &[u8]) -> ServerResult<()> {
        if self.closed {
            warn!(id = self.request_id, "Response already closed, dropping send");
            return Ok(());
        }

        debug!(id = self.request_id, len = raw.len(), "Send response to stream.");
        Header::write_to_stream_batches(
            RequestType::Stdout,
            self.request_id,
            &mut self.writer,
            &mut &raw[..],
        )
        .await?;

        self.close().await
    }

    /// Terminates the request if it has not been terminated yet.
    ///
    /// Emits the zero-length `STDOUT` and the `END_REQUEST` record.
    /// Idempotent.
    pub async fn flush(&mut self) -> ServerResult<()> {
        if self.closed {
            return Ok(());
        }
        self.close().await
    }

    async fn close(&mut self) -> ServerResult<()> {
        debug!(id = self.request_id, "Close stdout stream and end request.");

        Header::new(RequestType::Stdout, self.request_id, &[])?
            .write_to_stream(&mut self.writer, &[])
            .await?;
        EndRequestRec::new(self.request_id, 0, ProtocolStatus::RequestComplete)
            .write_to_stream(&mut self.writer)
            .await?;
        self.writer.flush().await?;

        self.closed = true;
        Ok(())
    }
}
