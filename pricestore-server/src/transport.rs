//! TCP transport for the boundary surface.
//!
//! Each accepted connection is served on its own task. Requests on one
//! connection are answered in order; a frame error closes that connection
//! without affecting the others.

use std::future::Future;

use pricestore::error::ProtocolError;
use pricestore::frame;
use pricestore::rpc::Service;
use tokio::net::{TcpListener, TcpStream};

/// Accepts connections until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, service: Service, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown requested, no longer accepting connections");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!("accept error: {e}");
                        continue;
                    }
                };

                tracing::debug!(%peer, "connection accepted");
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &service).await {
                        tracing::debug!(%peer, "connection dropped: {e}");
                    }
                });
            }
        }
    }
}

/// Answers framed requests until the peer closes the stream.
async fn handle_connection(mut stream: TcpStream, service: &Service) -> Result<(), ProtocolError> {
    while let Some(request) = frame::read_request(&mut stream).await? {
        let response = service.handle(&request.method, &request.body).await;
        frame::write_response(&mut stream, &response).await?;
    }
    Ok(())
}
