//! Demo broker binary.
//!
//! Identifies clients by the `token` query parameter, echoes inbound
//! frames, and understands two text commands: `join:<tag>` and
//! `leave:<tag>` for label membership. Useful for manual poking and load
//! drivers:
//!
//! ```sh
//! test-server --port 8080
//! websocat 'ws://127.0.0.1:8080/ws?token=alice'
//! ```

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use http::{HeaderMap, Uri};
use tracing::{info, warn};

use herd_server::{
    Broker, BrokerConfig, BrokerOptions, Connection, Hook, NetworkConfig, NetworkModule,
    OfflineReason,
};

#[derive(Debug, Parser)]
#[command(name = "test-server", about = "Herd demo broker")]
struct Args {
    /// Bind address.
    #[arg(long, env = "HERD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 = OS-assigned).
    #[arg(long, env = "HERD_PORT", default_value_t = 8080)]
    port: u16,

    /// Number of registry shards.
    #[arg(long, env = "HERD_BUCKETS", default_value_t = 16)]
    buckets: usize,

    /// Client heartbeat interval in seconds.
    #[arg(long, env = "HERD_HEARTBEAT_SECS", default_value_t = 120)]
    heartbeat_secs: u64,

    /// Expose Prometheus metrics on this port.
    #[arg(long, env = "HERD_METRICS_PORT")]
    metrics_port: Option<u16>,
}

/// Permissive hook for demos: any non-empty token is an identity.
#[derive(Default)]
struct DemoHook {
    broker: OnceLock<Arc<Broker>>,
}

impl DemoHook {
    fn broker(&self) -> Option<&Arc<Broker>> {
        self.broker.get()
    }
}

#[async_trait]
impl Hook for DemoHook {
    fn identify(&self, _headers: &HeaderMap, uri: &Uri) -> anyhow::Result<String> {
        for pair in uri.query().unwrap_or_default().split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
        }
        anyhow::bail!("missing token query parameter")
    }

    async fn validate(&self, _identity: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn validate_failed(&self, err: anyhow::Error, conn: &Arc<Connection>) {
        let _ = conn.send(Bytes::from(format!("rejected: {err}")));
        conn.close(false);
    }

    async fn validate_success(&self, conn: &Arc<Connection>) {
        let _ = conn.send(Bytes::from(format!("welcome {}", conn.identity())));
    }

    async fn handle_receive(&self, conn: &Arc<Connection>, payload: Bytes) {
        let text = String::from_utf8_lossy(&payload);
        if let Some(tag) = text.strip_prefix("join:") {
            if let Some(broker) = self.broker() {
                match broker.label_attach(conn, tag.trim()) {
                    Ok(()) => {
                        let _ = conn.send(Bytes::from(format!("joined {tag}")));
                    }
                    Err(err) => {
                        let _ = conn.send(Bytes::from(format!("join failed: {err}")));
                    }
                }
            }
            return;
        }
        if let Some(tag) = text.strip_prefix("leave:") {
            if let Some(broker) = self.broker() {
                broker.label_detach(conn, tag.trim());
                let _ = conn.send(Bytes::from(format!("left {tag}")));
            }
            return;
        }
        // Echo anything else.
        let _ = conn.send(payload);
    }

    async fn offline(&self, conn: &Arc<Connection>, reason: OfflineReason) {
        info!(identity = %conn.identity(), ?reason, "client taken offline");
        let _ = conn.send(Bytes::from_static(b"goodbye"));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Some(port) = args.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()?;
        info!(port, "prometheus exporter listening");
    }

    let hook = Arc::new(DemoHook::default());
    let broker = Broker::new(
        Arc::clone(&hook) as Arc<dyn Hook>,
        BrokerOptions {
            broker: BrokerConfig {
                bucket_count: args.buckets,
                heartbeat_interval: std::time::Duration::from_secs(args.heartbeat_secs),
                ..BrokerConfig::default()
            },
            ..BrokerOptions::default()
        },
    )?;
    if hook.broker.set(Arc::clone(&broker)).is_err() {
        warn!("demo hook already bound");
    }
    broker.run()?;

    let mut module = NetworkModule::new(
        Arc::clone(&broker),
        NetworkConfig {
            host: args.host,
            port: args.port,
            ..NetworkConfig::default()
        },
    );
    let port = module.start().await?;
    info!(port, "herd demo broker up");

    let triggered = module.shutdown_controller().shutdown_signal();
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = triggered => {}
        }
    };
    module.serve(shutdown).await?;

    if let Err(err) = broker.stop().await {
        warn!(%err, "broker was not running at shutdown");
    }
    Ok(())
}
