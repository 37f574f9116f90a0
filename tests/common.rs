#![allow(dead_code)]

use fastcgi_responder::{Connection, Handler, Request, Response, ServerResult};
use std::{sync::Arc, sync::Once, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static START: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
pub fn setup() {
    START.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

pub const BEGIN_REQUEST: u8 = 1;
pub const ABORT_REQUEST: u8 = 2;
pub const END_REQUEST: u8 = 3;
pub const PARAMS: u8 = 4;
pub const STDIN: u8 = 5;
pub const STDOUT: u8 = 6;
pub const GET_VALUES: u8 = 9;
pub const GET_VALUES_RESULT: u8 = 10;

/// Encodes one record the way a web server would, with optional
/// padding after the content.
pub fn record(r#type: u8, request_id: u16, content: &[u8], padding: u8) -> Vec<u8> {
    let mut buf = vec![1, r#type];
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(padding);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.extend(std::iter::repeat_n(0xffu8, padding as usize));
    buf
}

/// Encodes a begin request record.
pub fn begin_request(request_id: u16, role: u16, flags: u8) -> Vec<u8> {
    let mut body = role.to_be_bytes().to_vec();
    body.push(flags);
    body.extend_from_slice(&[0; 5]);
    record(BEGIN_REQUEST, request_id, &body, 0)
}

/// Encodes a name/value block.
pub fn name_value_block(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
    fn put_length(buf: &mut Vec<u8>, length: usize) {
        if length < 128 {
            buf.push(length as u8);
        } else {
            buf.extend_from_slice(&((length as u32) | 1 << 31).to_be_bytes());
        }
    }

    let mut buf = Vec::new();
    for (name, value) in pairs {
        put_length(&mut buf, name.len());
        put_length(&mut buf, value.len());
        buf.extend_from_slice(name);
        buf.extend_from_slice(value);
    }
    buf
}

/// Decodes a name/value block into pairs.
pub fn parse_name_value_block(mut buf: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    fn take_length(buf: &mut &[u8]) -> usize {
        if buf[0] < 128 {
            let length = buf[0] as usize;
            *buf = &buf[1..];
            length
        } else {
            let length = u32::from_be_bytes(<[u8; 4]>::try_from(&buf[..4]).unwrap()) & !(1 << 31);
            *buf = &buf[4..];
            length as usize
        }
    }

    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let name_length = take_length(&mut buf);
        let value_length = take_length(&mut buf);
        let name = buf[..name_length].to_vec();
        let value = buf[name_length..name_length + value_length].to_vec();
        buf = &buf[name_length + value_length..];
        pairs.push((name, value));
    }
    pairs
}

/// Splits a flat byte buffer of received records into
/// `(type, request id, content)` triples.
pub fn parse_records(mut buf: &[u8]) -> Vec<(u8, u16, Vec<u8>)> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        let r#type = buf[1];
        let request_id = u16::from_be_bytes([buf[2], buf[3]]);
        let content_length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let padding_length = buf[6] as usize;
        let end = 8 + content_length;
        records.push((r#type, request_id, buf[8..end].to_vec()));
        buf = &buf[end + padding_length..];
    }
    records
}

/// Writes a complete client script to a fresh in-memory connection,
/// signals end of input, and returns everything the responder wrote
/// along with the driver's exit result.
pub async fn drive<H: Handler>(handler: H, input: &[u8]) -> (Vec<u8>, ServerResult<()>) {
    setup();
    let (mut client, server) = tokio::io::duplex(1 << 20);
    client.write_all(input).await.unwrap();
    client.shutdown().await.unwrap();

    let task = tokio::spawn(
        Connection::new(server, Arc::new(handler), Duration::from_secs(5)).run(),
    );

    let mut output = Vec::new();
    client.read_to_end(&mut output).await.unwrap();
    (output, task.await.unwrap())
}

/// Reads records off a live stream until the closing end request.
pub async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<(u8, u16, Vec<u8>)> {
    let mut records = Vec::new();
    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await.unwrap();
        let r#type = header[1];
        let request_id = u16::from_be_bytes([header[2], header[3]]);
        let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_length = header[6] as usize;

        let mut content = vec![0; content_length + padding_length];
        stream.read_exact(&mut content).await.unwrap();
        content.truncate(content_length);

        records.push((r#type, request_id, content));
        if r#type == END_REQUEST {
            return records;
        }
    }
}

/// Answers every request with "hi" and the default headers.
pub struct HelloHandler;

#[async_trait::async_trait]
impl Handler for HelloHandler {
    async fn on_request_received(
        &self, _request: &Request, response: &mut Response<'_>,
    ) -> ServerResult<()> {
        response.send(b"hi").await
    }
}

/// Echoes the request parameters and body, sorted by parameter name.
pub struct EchoHandler;

#[async_trait::async_trait]
impl Handler for EchoHandler {
    async fn on_request_received(
        &self, request: &Request, response: &mut Response<'_>,
    ) -> ServerResult<()> {
        let mut lines: Vec<String> = request
            .params()
            .iter()
            .map(|(name, value)| format!("{name}={}", String::from_utf8_lossy(value)))
            .collect();
        lines.sort();
        lines.push(format!("body={}", String::from_utf8_lossy(request.body())));
        response.send(lines.join("\n").as_bytes()).await
    }
}
