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

//! FastCGI responder server for serving an upstream web server.
//!
//! This module provides the main `Server` struct that accepts TCP
//! connections from the web server on a loopback port and drives one
//! [`Connection`] per accepted socket, and the [`Handler`] trait the
//! application supplies to produce responses.

use crate::{
    conn::{Connection, DEFAULT_READ_TIMEOUT},
    error::{ServerError, ServerResult},
    request::Request,
    response::Response,
};
use async_trait::async_trait;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, info, warn};

/// Application hooks invoked by the connection drivers.
///
/// Hooks run on the worker that owns the connection and must therefore
/// be safe to call from several workers at once.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called exactly once per request, after the begin request record
    /// is processed and before any parameters are parsed. Intended for
    /// logging and early bookkeeping.
    ///
    /// # Arguments
    ///
    /// * `request` - The newly opened request
    fn on_request_incoming(&self, request: &Request) {
        let _ = request;
    }

    /// Called exactly once per completed request.
    ///
    /// The handler reads the request's parameters and body, mutates the
    /// response and may call [`Response::send`] or [`Response::flush`];
    /// a response left open on return is flushed by the driver. An
    /// error is answered with an empty body and a normal end request.
    ///
    /// # Arguments
    ///
    /// * `request` - The completed request
    /// * `response` - The staged response for this request
    async fn on_request_received(
        &self, request: &Request, response: &mut Response<'_>,
    ) -> ServerResult<()>;
}

/// State of a started server.
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// FastCGI responder listening on a loopback port.
///
/// Binds `127.0.0.1` only, matching the documented deployment behind a
/// web server's loopback `fastcgi_pass`.
pub struct Server<H> {
    handler: Arc<H>,
    read_timeout: Duration,
    running: Option<Running>,
}

impl<H: Handler> Server<H> {
    /// Creates a stopped server with the given application handler.
    ///
    /// # Arguments
    ///
    /// * `handler` - The application hooks
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            read_timeout: DEFAULT_READ_TIMEOUT,
            running: None,
        }
    }

    /// Sets the per-read timeout used by connections.
    ///
    /// # Arguments
    ///
    /// * `read_timeout` - Bound on each record read
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Replaces the application handler.
    ///
    /// Handlers may be replaced only while the server is stopped.
    ///
    /// # Arguments
    ///
    /// * `handler` - The new application hooks
    pub fn set_handler(&mut self, handler: H) -> ServerResult<()> {
        if self.is_active() {
            return Err(ServerError::AlreadyActive);
        }
        self.handler = Arc::new(handler);
        Ok(())
    }

    /// Binds `127.0.0.1` on the given port and begins accepting
    /// connections.
    ///
    /// Port 0 delegates the choice to the operating system; the
    /// assignment is observable through [`Server::local_addr`].
    ///
    /// # Arguments
    ///
    /// * `port` - The port to bind
    pub async fn start(&mut self, port: u16) -> ServerResult<()> {
        if self.is_active() {
            return Err(ServerError::AlreadyActive);
        }

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| ServerError::PortUnavailable { port, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, receiver) = watch::channel(false);
        let handler = self.handler.clone();
        let read_timeout = self.read_timeout;
        let accept_task = tokio::spawn(accept_loop(listener, receiver, handler, read_timeout));

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        info!(%local_addr, "Fastcgi responder started.");
        Ok(())
    }

    /// Stops accepting, waits for in-flight connections to finish, then
    /// releases the socket.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        let _ = running.accept_task.await;
        info!("Fastcgi responder stopped.");
    }

    /// Returns whether the server is currently accepting connections.
    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    /// Returns the bound address while the server is active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Returns a short identifier of this server implementation.
    pub fn version(&self) -> &'static str {
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))
    }
}

/// Accepts connections until shut down, then drains the spawned
/// connection workers before releasing the listener socket.
async fn accept_loop<H: Handler>(
    listener: TcpListener, mut shutdown: watch::Receiver<bool>, handler: Arc<H>,
    read_timeout: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection.");
                    let handler = handler.clone();
                    connections.spawn(async move {
                        let connection = Connection::new(stream, handler, read_timeout);
                        if let Err(error) = connection.run().await {
                            warn!(%error, "Connection terminated.");
                        }
                    });
                }
                Err(error) => {
                    warn!(%error, "Accept failed.");
                }
            },
        }
    }

    while connections.join_next().await.is_some() {}
    drop(listener);
}
