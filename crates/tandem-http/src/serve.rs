//! HTTP serve loop over hyper-util.
//!
//! Serves an axum `Router` (or any compatible tower service) from a
//! `TcpListener` without going through `axum::serve`, so the accept loop can
//! participate in process-wide cancellation: once the token fires the loop
//! stops accepting and in-flight connections get a bounded drain window.

use std::time::Duration;

use http_body::Body;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_service::Service;
use tracing::{debug, warn};

/// Accept and serve connections until `shutdown` fires, then wait up to
/// `grace` for in-flight connections to finish.
///
/// Socket-level accept errors trigger a 1-second sleep before retrying.
pub async fn serve<S, B>(
    listener: TcpListener,
    service: S,
    shutdown: CancellationToken,
    grace: Duration,
) -> std::io::Result<()>
where
    S: Service<http::Request<Incoming>, Response = http::Response<B>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let tracker = TaskTracker::new();

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
        };

        let svc = service.clone();
        tracker.spawn(async move {
            let io = TokioIo::new(stream);
            let hyper_svc = TowerToHyperService::new(svc);
            let builder = Builder::new(TokioExecutor::new());
            // Client disconnects surface here; they are routine.
            if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_svc).await {
                debug!(peer = %remote_addr, error = %e, "connection ended with error");
            }
        });
    }

    tracker.close();
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        warn!(
            open = tracker.len(),
            "shutdown grace expired with connections still open"
        );
    }
    Ok(())
}
