use axum::{Router, routing::get};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;

#[derive(Default)]
pub struct Metrics {
    pub checkins_total: AtomicU64,
    pub checkouts_total: AtomicU64,
    pub duplicates_rejected: AtomicU64,
    pub rate_limits_hit: AtomicU64,
    pub ratings_total: AtomicU64,
    pub messages_posted: AtomicU64,
    pub messages_pruned: AtomicU64,
    pub ws_connections_total: AtomicU64,
    pub ws_connections_active: AtomicU64,
    pub daily_resets: AtomicU64,
    pub identity_failures: AtomicU64,
    pub snapshots_saved: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_checkins(&self) {
        self.checkins_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_checkouts(&self) {
        self.checkouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicates(&self) {
        self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limits(&self) {
        self.rate_limits_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ratings(&self) {
        self.ratings_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages(&self) {
        self.messages_posted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_pruned(&self, n: u64) {
        self.messages_pruned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_ws_connections(&self) {
        self.ws_connections_total.fetch_add(1, Ordering::Relaxed);
        self.ws_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_ws_connections(&self) {
        self.ws_connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_daily_resets(&self) {
        self.daily_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_identity_failures(&self) {
        self.identity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_snapshots(&self) {
        self.snapshots_saved.fetch_add(1, Ordering::Relaxed);
    }

    fn format_prometheus(&self) -> String {
        format!(
            "# HELP playground_checkins_total Successful check-ins\n\
             # TYPE playground_checkins_total counter\n\
             playground_checkins_total {}\n\
             # HELP playground_checkouts_total Successful check-outs\n\
             # TYPE playground_checkouts_total counter\n\
             playground_checkouts_total {}\n\
             # HELP playground_duplicates_rejected Duplicate-state rejections\n\
             # TYPE playground_duplicates_rejected counter\n\
             playground_duplicates_rejected {}\n\
             # HELP playground_rate_limits_hit Rate limits triggered\n\
             # TYPE playground_rate_limits_hit counter\n\
             playground_rate_limits_hit {}\n\
             # HELP playground_ratings_total Ratings accepted\n\
             # TYPE playground_ratings_total counter\n\
             playground_ratings_total {}\n\
             # HELP playground_messages_posted Chat messages accepted\n\
             # TYPE playground_messages_posted counter\n\
             playground_messages_posted {}\n\
             # HELP playground_messages_pruned Chat messages dropped by retention\n\
             # TYPE playground_messages_pruned counter\n\
             playground_messages_pruned {}\n\
             # HELP playground_ws_connections_total Total chat socket connections\n\
             # TYPE playground_ws_connections_total counter\n\
             playground_ws_connections_total {}\n\
             # HELP playground_ws_connections_active Active chat socket connections\n\
             # TYPE playground_ws_connections_active gauge\n\
             playground_ws_connections_active {}\n\
             # HELP playground_daily_resets Daily occupancy resets performed\n\
             # TYPE playground_daily_resets counter\n\
             playground_daily_resets {}\n\
             # HELP playground_identity_failures Token verifications that failed\n\
             # TYPE playground_identity_failures counter\n\
             playground_identity_failures {}\n\
             # HELP playground_snapshots_saved State snapshots written\n\
             # TYPE playground_snapshots_saved counter\n\
             playground_snapshots_saved {}\n",
            self.checkins_total.load(Ordering::Relaxed),
            self.checkouts_total.load(Ordering::Relaxed),
            self.duplicates_rejected.load(Ordering::Relaxed),
            self.rate_limits_hit.load(Ordering::Relaxed),
            self.ratings_total.load(Ordering::Relaxed),
            self.messages_posted.load(Ordering::Relaxed),
            self.messages_pruned.load(Ordering::Relaxed),
            self.ws_connections_total.load(Ordering::Relaxed),
            self.ws_connections_active.load(Ordering::Relaxed),
            self.daily_resets.load(Ordering::Relaxed),
            self.identity_failures.load(Ordering::Relaxed),
            self.snapshots_saved.load(Ordering::Relaxed),
        )
    }
}

pub async fn run_metrics_server(config: MetricsConfig, metrics: Arc<Metrics>) {
    if !config.enable {
        return;
    }

    let path = config.path.clone();
    let app = Router::new()
        .route(&path, get(move || {
            let m = metrics.clone();
            async move { m.format_prometheus() }
        }));

    let addr: std::net::SocketAddr = match config.bind_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("Invalid metrics bind address: {}", e);
            return;
        }
    };

    info!("Metrics server listening on {}{}", addr, path);

    if let Ok(listener) = TcpListener::bind(addr).await {
        let _ = axum::serve(listener, app).await;
    }
}
