//! tandemd: the tandem rendezvous relay daemon.
//!
//! Hosts the WebSocket relay plane (`/ws`), the staged object data plane
//! (`/objects/...`), and the legacy pairing routes (`/api/...`) on one
//! listener. SIGINT/SIGTERM cancel the background GC tasks and give the
//! HTTP side a 5 second drain.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tandem_core::{Switchboard, SwitchboardConfig};
use tandem_http::cors::{cors_layer, preflight_status};
use tandem_http::objects::{self, ObjectsState};
use tandem_http::pairing::{self, PairingService};
use tandem_http::ws::{ws_handler, WsState};
use tandem_http::{request_id_middleware, serve};
use tandem_store::FsStore;

/// Grace period for in-flight HTTP work after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Object GC cadence; the TTL itself comes from `--gc_ttl`.
const OBJECT_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "tandemd")]
#[command(about = "Two-party rendezvous relay with a staged object data plane")]
struct Args {
    /// Listen address; a bare `:port` binds all interfaces
    #[arg(long, default_value = ":1234")]
    addr: String,

    /// Accept any WebSocket origin (development only)
    #[arg(long)]
    dev: bool,

    /// Object store root directory
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Public base URL for upload/manifest links
    #[arg(long, default_value = "http://localhost:1234")]
    base: String,

    /// Allowed CORS origin, or `*` for any
    #[arg(long, default_value = "*")]
    cors: String,

    /// Object TTL for the hourly GC sweep (e.g. 24h, 30m, 90s)
    #[arg(long = "gc_ttl", default_value = "24h", value_parser = parse_duration)]
    gc_ttl: Duration,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = FsStore::open(&args.data).await?;
    let switchboard = Arc::new(Switchboard::new(SwitchboardConfig::default()));
    let pairing = Arc::new(PairingService::default());
    let cancel = CancellationToken::new();

    tokio::spawn(Arc::clone(&switchboard).run_gc(cancel.child_token()));
    tokio::spawn(object_gc(store.clone(), args.gc_ttl, cancel.child_token()));

    let ws_state = WsState {
        switchboard,
        allowed_origins: Arc::new(origin_allow_list(&args.cors)),
        dev: args.dev,
    };
    let objects_state = ObjectsState {
        store,
        base_url: args.base.trim_end_matches('/').to_owned(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(ws_state)
        .merge(objects::router(objects_state))
        .nest("/api", pairing::router(pairing))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(cors_layer(&args.cors))
        .layer(axum::middleware::from_fn(preflight_status));

    let addr = normalize_addr(&args.addr);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, data = %args.data.display(), dev = args.dev, "tandemd listening");

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    serve(listener, app, cancel, SHUTDOWN_GRACE).await?;
    info!("bye");
    Ok(())
}

/// Hourly object sweep, stopped by cancellation.
async fn object_gc(store: FsStore, ttl: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(OBJECT_GC_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.gc(ttl).await {
                    error!(error = %e, "object gc sweep failed");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

// The WS origin allow-list mirrors the CORS configuration; `*` means the
// list stays empty and only `--dev` bypasses the check.
fn origin_allow_list(cors: &str) -> HashSet<String> {
    if cors == "*" {
        return HashSet::new();
    }
    cors.split(',')
        .map(|o| o.trim().to_owned())
        .filter(|o| !o.is_empty())
        .collect()
}

/// `:1234` binds every interface, anything else passes through untouched.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_owned()
    }
}

/// Parse durations of the form `24h`, `30m`, `90s` or `500ms`.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (value, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| raw.split_at(i))
        .ok_or_else(|| format!("missing unit in duration {raw:?} (want s, m, h or ms)"))?;
    let value: u64 = value
        .parse()
        .map_err(|_| format!("bad number in duration {raw:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!("unknown duration unit {unit:?} (want s, m, h or ms)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("24").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("24d").is_err());
    }

    #[test]
    fn addr_normalization() {
        assert_eq!(normalize_addr(":1234"), "0.0.0.0:1234");
        assert_eq!(normalize_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[test]
    fn origin_lists() {
        assert!(origin_allow_list("*").is_empty());
        let list = origin_allow_list("http://a.example, http://b.example");
        assert!(list.contains("http://a.example"));
        assert!(list.contains("http://b.example"));
    }
}
