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

//! Internal FastCGI protocol metadata structures and parsing.
//!
//! This module contains the internal structures and constants used
//! for parsing and generating FastCGI protocol messages.

use crate::error::{ServerError, ServerResult};
use bytes::Bytes;
use std::{
    fmt::{self, Display},
    mem::size_of,
};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// FastCGI protocol version 1
pub(crate) const VERSION_1: u8 = 1;
/// Maximum length for FastCGI content
pub(crate) const MAX_LENGTH: usize = 0xffff;
/// Length of FastCGI header in bytes
pub(crate) const HEADER_LEN: usize = size_of::<Header>();
/// Length of the begin request record body in bytes
pub(crate) const BEGIN_REQUEST_LEN: usize = 8;

/// FastCGI request types as defined in the protocol specification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Begin request record type
    BeginRequest = 1,
    /// Abort request record type
    AbortRequest = 2,
    /// End request record type
    EndRequest = 3,
    /// Parameters record type
    Params = 4,
    /// Stdin record type
    Stdin = 5,
    /// Stdout record type
    Stdout = 6,
    /// Stderr record type
    Stderr = 7,
    /// Data record type
    Data = 8,
    /// Get values record type
    GetValues = 9,
    /// Get values result record type
    GetValuesResult = 10,
    /// Unknown type record type
    UnknownType = 11,
}

impl RequestType {
    /// Converts a u8 value to RequestType.
    ///
    /// Any code outside the defined set normalises to `UnknownType`.
    ///
    /// # Arguments
    ///
    /// * `u` - The numeric value to convert
    fn from_u8(u: u8) -> Self {
        match u {
            1 => RequestType::BeginRequest,
            2 => RequestType::AbortRequest,
            3 => RequestType::EndRequest,
            4 => RequestType::Params,
            5 => RequestType::Stdin,
            6 => RequestType::Stdout,
            7 => RequestType::Stderr,
            8 => RequestType::Data,
            9 => RequestType::GetValues,
            10 => RequestType::GetValuesResult,
            _ => RequestType::UnknownType,
        }
    }
}

impl Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&(self.clone() as u8), f)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Header {
    /// FastCGI protocol version
    pub(crate) version: u8,
    /// Type of the FastCGI record
    pub(crate) r#type: RequestType,
    /// Request ID for this record
    pub(crate) request_id: u16,
    /// Length of the content data
    pub(crate) content_length: u16,
    /// Length of padding data
    pub(crate) padding_length: u8,
    /// Reserved byte
    pub(crate) reserved: u8,
}

impl Header {
    /// Writes data to a stream in batches with proper FastCGI headers.
    ///
    /// The content is split into records of at most [`MAX_LENGTH`] bytes.
    /// No record is emitted for an empty content source; closing the
    /// stream with a zero-length record is up to the caller.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `writer` - The writer to write to
    /// * `content` - The content to write
    pub(crate) async fn write_to_stream_batches<R, W>(
        r#type: RequestType, request_id: u16, writer: &mut W, content: &mut R,
    ) -> ServerResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf: [u8; MAX_LENGTH] = [0; MAX_LENGTH];

        loop {
            let read = content.read(&mut buf).await?;
            if read == 0 {
                break;
            }

            let buf = &buf[..read];
            let header = Self::new(r#type.clone(), request_id, buf)?;
            header.write_to_stream(writer, buf).await?;
        }
        Ok(())
    }

    /// Creates a new header with given parameters.
    ///
    /// Content longer than the 16-bit length field is rejected; callers
    /// with larger payloads must chunk through
    /// [`Header::write_to_stream_batches`]. Records are written without
    /// padding.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `content` - The content data
    pub(crate) fn new(r#type: RequestType, request_id: u16, content: &[u8]) -> ServerResult<Self> {
        if content.len() > MAX_LENGTH {
            return Err(ServerError::OversizeRecord {
                length: content.len(),
            });
        }
        Ok(Self {
            version: VERSION_1,
            r#type,
            request_id,
            content_length: content.len() as u16,
            padding_length: 0,
            reserved: 0,
        })
    }

    /// Writes the header and content to a stream.
    ///
    /// # Arguments
    ///
    /// * `writer` - The writer to write to
    /// * `content` - The content to write
    pub(crate) async fn write_to_stream<W: AsyncWrite + Unpin>(
        self, writer: &mut W, content: &[u8],
    ) -> io::Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        buf.push(self.version);
        buf.push(self.r#type as u8);
        buf.write_u16(self.request_id).await?;
        buf.write_u16(self.content_length).await?;
        buf.push(self.padding_length);
        buf.push(self.reserved);

        writer.write_all(&buf).await?;
        writer.write_all(content).await?;

        Ok(())
    }

    /// Creates a new header by reading from a stream.
    ///
    /// # Arguments
    ///
    /// * `reader` - The reader to read from
    pub(crate) async fn new_from_stream<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> ServerResult<Self> {
        let mut buf: [u8; HEADER_LEN] = [0; HEADER_LEN];
        reader.read_exact(&mut buf).await?;

        let header = Self::new_from_buf(&buf);
        if header.version != VERSION_1 {
            return Err(ServerError::UnsupportedVersion {
                version: header.version,
            });
        }
        Ok(header)
    }

    /// Creates a new header from a buffer.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer containing header data
    #[inline]
    pub(crate) fn new_from_buf(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            r#type: RequestType::from_u8(buf[1]),
            request_id: be_buf_to_u16(&buf[2..4]),
            content_length: be_buf_to_u16(&buf[4..6]),
            padding_length: buf[6],
            reserved: buf[7],
        }
    }

    /// Reads content from a stream based on the header's content length.
    ///
    /// Padding bytes are consumed and discarded.
    ///
    /// # Arguments
    ///
    /// * `reader` - The reader to read from
    pub(crate) async fn read_content_from_stream<R: AsyncRead + Unpin>(
        &self, reader: &mut R,
    ) -> io::Result<Bytes> {
        let mut buf = vec![0; self.content_length as usize];
        reader.read_exact(&mut buf).await?;
        let mut padding_buf = vec![0; self.padding_length as usize];
        reader.read_exact(&mut padding_buf).await?;
        Ok(buf.into())
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(dead_code)]
pub enum Role {
    /// Responder role - handles requests and returns responses
    Responder = 1,
    /// Authorizer role - performs authorization checks
    Authorizer = 2,
    /// Filter role - filters data between web server and application
    Filter = 3,
}

impl Role {
    /// Converts a u16 value to Role.
    ///
    /// # Arguments
    ///
    /// * `u` - The numeric value to convert
    pub(crate) fn from_u16(u: u16) -> Option<Self> {
        match u {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// Begin request record body data, as received from the web server.
#[derive(Debug)]
pub(crate) struct BeginRequest {
    /// The requested role, a 16-bit big-endian integer
    pub(crate) role: u16,
    /// Flags byte (bit 0 = keep alive flag)
    pub(crate) flags: u8,
}

impl BeginRequest {
    /// Whether the web server asked to keep the connection open after
    /// the response.
    pub(crate) fn keep_alive(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// Complete begin request record with header and parsed content.
#[derive(Debug)]
pub(crate) struct BeginRequestRec {
    /// The FastCGI header
    #[allow(dead_code)]
    pub(crate) header: Header,
    /// The begin request data
    pub(crate) begin_request: BeginRequest,
}

impl BeginRequestRec {
    /// Creates a begin request record from a header and its content.
    ///
    /// # Arguments
    ///
    /// * `header` - The FastCGI header
    /// * `content` - The record content, at least 8 bytes
    pub(crate) fn new_from_content(header: Header, content: &[u8]) -> ServerResult<Self> {
        if content.len() < BEGIN_REQUEST_LEN {
            return Err(ServerError::MalformedRecord {
                request_type: RequestType::BeginRequest,
            });
        }
        let begin_request = BeginRequest {
            role: be_buf_to_u16(&content[0..2]),
            flags: content[2],
        };
        Ok(Self {
            header,
            begin_request,
        })
    }
}

/// FastCGI protocol status codes.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
#[allow(dead_code)]
pub enum ProtocolStatus {
    /// Request completed successfully
    RequestComplete = 0,
    /// This app can't multiplex connections
    CantMpxConn = 1,
    /// New request rejected; too busy
    Overloaded = 2,
    /// Role value not known
    UnknownRole = 3,
}

/// Complete end request record, the trailer of every response.
#[derive(Debug)]
pub(crate) struct EndRequestRec {
    /// The FastCGI header
    header: Header,
    /// The application status code
    app_status: u32,
    /// The protocol status
    protocol_status: ProtocolStatus,
}

impl EndRequestRec {
    /// Creates a new end request record.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request ID
    /// * `app_status` - The application status code
    /// * `protocol_status` - The protocol status
    pub(crate) fn new(request_id: u16, app_status: u32, protocol_status: ProtocolStatus) -> Self {
        let header = Header {
            version: VERSION_1,
            r#type: RequestType::EndRequest,
            request_id,
            content_length: BEGIN_REQUEST_LEN as u16,
            padding_length: 0,
            reserved: 0,
        };
        Self {
            header,
            app_status,
            protocol_status,
        }
    }

    /// Converts the end request body to bytes.
    async fn to_content(&self) -> io::Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::new();
        buf.write_u32(self.app_status).await?;
        buf.push(self.protocol_status as u8);
        buf.extend_from_slice(&[0; 3]);
        Ok(buf)
    }

    /// Writes the end request record to a stream.
    ///
    /// # Arguments
    ///
    /// * `writer` - The writer to write to
    pub(crate) async fn write_to_stream<W: AsyncWrite + Unpin>(
        self, writer: &mut W,
    ) -> io::Result<()> {
        let content = self.to_content().await?;
        self.header.write_to_stream(writer, &content).await
    }
}

/// Parameter length encoding for FastCGI.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParamLength {
    /// Short length (0-127 bytes)
    Short(u8),
    /// Long length (128+ bytes)
    Long(u32),
}

impl ParamLength {
    /// Creates a new parameter length encoding.
    ///
    /// Lengths that do not fit the 31-bit long form are rejected.
    ///
    /// # Arguments
    ///
    /// * `length` - The length to encode
    pub(crate) fn new(length: usize) -> ServerResult<Self> {
        if length < 128 {
            Ok(ParamLength::Short(length as u8))
        } else if (length as u64) < 1 << 31 {
            let mut length = length as u32;
            length |= 1 << 31;
            Ok(ParamLength::Long(length))
        } else {
            Err(ServerError::OversizeParameter { length })
        }
    }

    /// Converts the parameter length to bytes.
    pub(crate) async fn content(self) -> io::Result<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::new();
        match self {
            ParamLength::Short(l) => buf.push(l),
            ParamLength::Long(l) => buf.write_u32(l).await?,
        }
        Ok(buf)
    }

    /// Reads one encoded length from the front of a buffer, returning
    /// the length and the number of bytes consumed.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer to read from
    pub(crate) fn parse(buf: &[u8]) -> ServerResult<(usize, usize)> {
        let b0 = *buf.first().ok_or(ServerError::MalformedParams)?;
        if b0 < 128 {
            return Ok((b0 as usize, 1));
        }
        if buf.len() < 4 {
            return Err(ServerError::MalformedParams);
        }
        let length = ((b0 as usize & 0x7f) << 24)
            | ((buf[1] as usize) << 16)
            | ((buf[2] as usize) << 8)
            | buf[3] as usize;
        Ok((length, 4))
    }
}

/// A single parameter name-value pair.
#[derive(Debug)]
pub(crate) struct ParamPair<'a> {
    /// The parameter name
    name_data: &'a [u8],
    /// The parameter value
    value_data: &'a [u8],
}

impl<'a> ParamPair<'a> {
    /// Creates a new parameter pair.
    ///
    /// # Arguments
    ///
    /// * `name` - The parameter name
    /// * `value` - The parameter value
    pub(crate) fn new(name: &'a [u8], value: &'a [u8]) -> Self {
        Self {
            name_data: name,
            value_data: value,
        }
    }

    /// Writes the parameter pair to a stream.
    ///
    /// # Arguments
    ///
    /// * `writer` - The writer to write to
    async fn write_to_stream<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> ServerResult<()> {
        let name_length = ParamLength::new(self.name_data.len())?;
        let value_length = ParamLength::new(self.value_data.len())?;
        writer.write_all(&name_length.content().await?).await?;
        writer.write_all(&value_length.content().await?).await?;
        writer.write_all(self.name_data).await?;
        writer.write_all(self.value_data).await?;
        Ok(())
    }
}

/// Encodes a sequence of name-value pairs as a FastCGI name/value block.
///
/// # Arguments
///
/// * `pairs` - The pairs to encode, in emission order
pub(crate) async fn encode_name_value_pairs(pairs: &[ParamPair<'_>]) -> ServerResult<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    for pair in pairs {
        pair.write_to_stream(&mut buf).await?;
    }
    Ok(buf)
}

/// Decodes a complete FastCGI name/value block.
///
/// The whole buffer must be consumed; a short buffer is a framing error.
///
/// # Arguments
///
/// * `buf` - The buffer holding the block
pub(crate) fn decode_name_value_pairs(buf: &Bytes) -> ServerResult<Vec<(Bytes, Bytes)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let (name_length, read) = ParamLength::parse(&buf[pos..])?;
        pos += read;
        let (value_length, read) = ParamLength::parse(&buf[pos..])?;
        pos += read;

        let end = name_length
            .checked_add(value_length)
            .and_then(|l| l.checked_add(pos))
            .ok_or(ServerError::MalformedParams)?;
        if end > buf.len() {
            return Err(ServerError::MalformedParams);
        }

        let name = buf.slice(pos..pos + name_length);
        let value = buf.slice(pos + name_length..end);
        pos = end;
        pairs.push((name, value));
    }

    Ok(pairs)
}

/// Converts big-endian bytes to u16.
///
/// # Arguments
///
/// * `buf` - The buffer containing the bytes
fn be_buf_to_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes(<[u8; 2]>::try_from(buf).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode_header(header: Header, content: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        header.write_to_stream(&mut buf, content).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn header_round_trip() {
        let header = Header::new(RequestType::Stdout, 0x0102, b"hello").unwrap();
        let buf = encode_header(header.clone(), b"hello").await;
        assert_eq!(buf.len(), HEADER_LEN + 5);

        let decoded = Header::new_from_buf(&<[u8; HEADER_LEN]>::try_from(&buf[..8]).unwrap());
        assert_eq!(decoded.version, VERSION_1);
        assert_eq!(decoded.r#type, RequestType::Stdout);
        assert_eq!(decoded.request_id, 0x0102);
        assert_eq!(decoded.content_length, 5);
        assert_eq!(decoded.padding_length, 0);
    }

    #[tokio::test]
    async fn header_fields_are_big_endian() {
        let header = Header::new(RequestType::EndRequest, 1, &[0; 300]).unwrap();
        let buf = encode_header(header, &[0; 300]).await;
        assert_eq!(&buf[..8], &[1, 3, 0, 1, 0x01, 0x2c, 0, 0]);
    }

    #[test]
    fn oversize_content_is_rejected_on_write() {
        let content = vec![0; MAX_LENGTH + 1];
        let err = Header::new(RequestType::Stdout, 1, &content).unwrap_err();
        assert!(matches!(
            err,
            ServerError::OversizeRecord { length } if length == MAX_LENGTH + 1
        ));
    }

    #[tokio::test]
    async fn bad_version_is_rejected() {
        let mut bytes: &[u8] = &[2, 6, 0, 1, 0, 0, 0, 0];
        let err = Header::new_from_stream(&mut bytes).await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::UnsupportedVersion { version: 2 }
        ));
    }

    #[tokio::test]
    async fn unknown_type_codes_are_normalised() {
        let mut bytes: &[u8] = &[1, 42, 0, 1, 0, 0, 0, 0];
        let header = Header::new_from_stream(&mut bytes).await.unwrap();
        assert_eq!(header.r#type, RequestType::UnknownType);
    }

    #[tokio::test]
    async fn padding_is_consumed_on_read() {
        let header = Header {
            version: VERSION_1,
            r#type: RequestType::Params,
            request_id: 1,
            content_length: 3,
            padding_length: 5,
            reserved: 0,
        };
        let mut bytes: &[u8] = &[b'a', b'b', b'c', 0xff, 0xff, 0xff, 0xff, 0xff, 9, 9];
        let content = header.read_content_from_stream(&mut bytes).await.unwrap();
        assert_eq!(&content[..], b"abc");
        // Only the trailing two bytes, after the padding, are left.
        assert_eq!(bytes, &[9, 9]);
    }

    #[tokio::test]
    async fn batches_split_at_record_size_ceiling() {
        let content = vec![b'x'; MAX_LENGTH + 1];
        let mut buf = Vec::new();
        Header::write_to_stream_batches(
            RequestType::Stdout,
            1,
            &mut buf,
            &mut content.as_slice(),
        )
        .await
        .unwrap();

        // First record carries 65535 bytes, the second the single leftover.
        let first = Header::new_from_buf(&<[u8; HEADER_LEN]>::try_from(&buf[..8]).unwrap());
        assert_eq!(first.content_length as usize, MAX_LENGTH);
        let second_at = HEADER_LEN + MAX_LENGTH;
        let second = Header::new_from_buf(
            &<[u8; HEADER_LEN]>::try_from(&buf[second_at..second_at + 8]).unwrap(),
        );
        assert_eq!(second.content_length, 1);
        assert_eq!(buf.len(), 2 * HEADER_LEN + MAX_LENGTH + 1);
    }

    #[tokio::test]
    async fn batches_emit_nothing_for_empty_content() {
        let mut buf = Vec::new();
        Header::write_to_stream_batches(
            RequestType::Stdout,
            1,
            &mut buf,
            &mut tokio::io::empty(),
        )
        .await
        .unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn begin_request_role_is_big_endian() {
        let header = Header::new(RequestType::BeginRequest, 1, &[0; 8]).unwrap();
        let rec =
            BeginRequestRec::new_from_content(header, &[0, 1, 1, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(rec.begin_request.role, 1);
        assert!(rec.begin_request.keep_alive());

        let header = Header::new(RequestType::BeginRequest, 1, &[0; 8]).unwrap();
        let rec =
            BeginRequestRec::new_from_content(header, &[1, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(rec.begin_request.role, 256);
        assert!(!rec.begin_request.keep_alive());
    }

    #[test]
    fn short_begin_request_body_is_malformed() {
        let header = Header::new(RequestType::BeginRequest, 1, &[0; 3]).unwrap();
        let err = BeginRequestRec::new_from_content(header, &[0, 1, 0]).unwrap_err();
        assert!(matches!(err, ServerError::MalformedRecord { .. }));
    }

    #[tokio::test]
    async fn end_request_encoding() {
        let rec = EndRequestRec::new(7, 0, ProtocolStatus::RequestComplete);
        let mut buf = Vec::new();
        rec.write_to_stream(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            vec![1, 3, 0, 7, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn param_length_encoding_widths() {
        for length in [0usize, 1, 127] {
            let content = ParamLength::new(length).unwrap().content().await.unwrap();
            assert_eq!(content.len(), 1, "length {length}");
            let (parsed, read) = ParamLength::parse(&content).unwrap();
            assert_eq!((parsed, read), (length, 1));
        }
        for length in [128usize, 65535, (1 << 31) - 1] {
            let content = ParamLength::new(length).unwrap().content().await.unwrap();
            assert_eq!(content.len(), 4, "length {length}");
            assert_eq!(content[0] & 0x80, 0x80);
            let (parsed, read) = ParamLength::parse(&content).unwrap();
            assert_eq!((parsed, read), (length, 4));
        }
    }

    #[test]
    fn param_length_rejects_out_of_range() {
        let err = ParamLength::new(1 << 31).unwrap_err();
        assert!(matches!(err, ServerError::OversizeParameter { .. }));
    }

    #[tokio::test]
    async fn name_value_block_round_trip() {
        let long_value = vec![b'v'; 300];
        let pairs = vec![
            ParamPair::new(b"REQUEST_METHOD", b"GET"),
            ParamPair::new(b"QUERY_STRING", b""),
            ParamPair::new(b"HTTP_COOKIE", &long_value),
        ];
        let block = Bytes::from(encode_name_value_pairs(&pairs).await.unwrap());

        let decoded = decode_name_value_pairs(&block).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(&decoded[0].0[..], b"REQUEST_METHOD");
        assert_eq!(&decoded[0].1[..], b"GET");
        assert_eq!(&decoded[1].1[..], b"");
        assert_eq!(decoded[2].1.len(), 300);
    }

    #[test]
    fn short_name_value_block_is_framing_error() {
        // Claims a 5-byte name but only 2 bytes follow.
        let block = Bytes::from_static(&[5, 0, b'a', b'b']);
        let err = decode_name_value_pairs(&block).unwrap_err();
        assert!(matches!(err, ServerError::MalformedParams));
    }
}
