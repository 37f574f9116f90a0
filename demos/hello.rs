use fastcgi_responder::{Handler, Request, Response, Server, ServerResult};
use tracing::info;

/// Minimal responder: answers every request with a greeting, for an
/// nginx `fastcgi_pass 127.0.0.1:9000;` location.
struct Hello;

#[async_trait::async_trait]
impl Handler for Hello {
    fn on_request_incoming(&self, request: &Request) {
        info!(id = request.id(), "Incoming request");
    }

    async fn on_request_received(
        &self, request: &Request, response: &mut Response<'_>,
    ) -> ServerResult<()> {
        let uri = request
            .params()
            .get_str("REQUEST_URI")
            .unwrap_or_default()
            .into_owned();
        response
            .send(format!("<html><body>hello world, {uri}</body></html>").as_bytes())
            .await
    }
}

#[tokio::main]
async fn main() -> ServerResult<()> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new(Hello);
    server.start(9000).await?;
    info!(version = server.version(), "Serving on 127.0.0.1:9000");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
