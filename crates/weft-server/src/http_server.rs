//! HTTP Server for the Weft engine
//!
//! hyper HTTP/1.1 server: one tokio task per connection, every request
//! handed to the [`EngineRouter`]. Requests never wait on each other here;
//! serialization happens only inside the dispatcher.
//!
//! # Example
//!
//! ```no_run
//! use weft_server::{Engine, EngineConfig, HttpServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Arc::new(Engine::new(EngineConfig::default()).unwrap());
//!     let server = HttpServer::new(engine);
//!     server.run("127.0.0.1:3000".parse().unwrap()).await.unwrap();
//! }
//! ```

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use weft_common::{Result, WeftError};

use crate::engine::Engine;
use crate::http_router::EngineRouter;

pub struct HttpServer {
    router: Arc<EngineRouter>,
}

impl HttpServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            router: Arc::new(EngineRouter::new(engine)),
        }
    }

    /// Binds `addr` and serves until the process exits.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WeftError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| WeftError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("HTTP server listening on {}", local);

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let router = self.router.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(router.handle(req, Some(remote)).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::warn!("Error serving connection from {}: {}", remote, err);
                }
            });
        }
    }
}
