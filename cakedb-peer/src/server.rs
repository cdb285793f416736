//! HTTP/1 accept loop for the peer endpoint.

use bytes::Bytes;
use cakedb_core::SqliteRevisionStore;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::handlers::{PeerAuth, handle_peer_request, json_error};

/// Largest accepted request body.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Shared state of a running peer endpoint.
pub struct PeerServer {
    store: Arc<SqliteRevisionStore>,
    auth: Option<PeerAuth>,
}

impl PeerServer {
    pub fn new(store: Arc<SqliteRevisionStore>, auth: Option<PeerAuth>) -> Self {
        Self { store, auth }
    }

    pub fn store(&self) -> &Arc<SqliteRevisionStore> {
        &self.store
    }

    /// Accept connections until `shutdown` turns true.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!("Peer endpoint listening on {}", listener.local_addr()?);
        loop {
            let (stream, remote) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => break,
            };
            debug!("Connection from {}", remote);
            let server = self.clone();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service_fn(move |req| handle_request(req, server.clone())))
                    .await
                {
                    error!("Error serving connection: {:?}", e);
                }
            });
        }
        info!("Peer endpoint stopped");
        Ok(())
    }
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    server: Arc<PeerServer>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = match Limited::new(req.into_body(), MAX_BODY_SIZE).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Rejected request body: {}", e);
            return Ok(json_error(413, "Request body too large or unreadable"));
        }
    };

    let response = handle_peer_request(
        &path,
        &method,
        authorization.as_deref(),
        &body,
        &query,
        &server.store,
        server.auth.as_ref(),
    )
    .await;

    debug!("{} {} -> {}", method, path, response.status());
    Ok(response)
}
