//! Network module with deferred startup lifecycle.
//!
//! `new()` wires shared state, `start()` binds the TCP listener, and
//! `serve()` accepts connections until the shutdown signal fires. The
//! separation lets the embedder attach labels, hooks, and discovery between
//! binding and accepting.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::network::handlers::{
    broadcast_handler, health_handler, label_broadcast_handler, label_info_handler,
    labels_handler, liveness_handler, readiness_handler, send_handler, ws_upgrade_handler,
    AppState,
};
use crate::network::middleware::build_http_layers;
use crate::network::shutdown::ShutdownController;
use crate::registry::Broker;

/// How long the drain phase waits for in-flight admin requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the full HTTP/WebSocket server lifecycle around a broker.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    broker: Arc<Broker>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a network module without binding any port. The shutdown
    /// controller shares the broker's root cancellation token, so
    /// `Broker::stop` and `trigger_shutdown` observe the same signal.
    #[must_use]
    pub fn new(broker: Arc<Broker>, config: NetworkConfig) -> Self {
        let shutdown = Arc::new(ShutdownController::new(broker.cancel_token()));
        Self {
            config,
            listener: None,
            broker,
            shutdown,
        }
    }

    /// Shared reference to the broker.
    #[must_use]
    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.broker)
    }

    /// Shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /ws` -- WebSocket upgrade
    /// - `GET /health`, `/health/live`, `/health/ready` -- health surface
    /// - `POST /v1/send` -- targeted send / fleet fallback
    /// - `POST /v1/broadcast` -- async broadcast (plain or inner join)
    /// - `POST /v1/labels/broadcast` -- per-tag payloads
    /// - `GET /v1/labels`, `GET /v1/labels/{tag}` -- label inspection
    #[must_use]
    pub fn build_router(&self) -> Router {
        let state = AppState {
            broker: Arc::clone(&self.broker),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        };

        let layers = build_http_layers(&self.config);

        Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/v1/send", post(send_handler))
            .route("/v1/broadcast", post(broadcast_handler))
            .route("/v1/labels/broadcast", post(label_broadcast_handler))
            .route("/v1/labels", get(labels_handler))
            .route("/v1/labels/{tag}", get(label_info_handler))
            .layer(layers)
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which differs from the configured one
    /// when port 0 (OS-assigned) is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future resolves, then drains.
    ///
    /// Consumes `self` because the listener moves into the server.
    ///
    /// # Errors
    ///
    /// Returns an error on a fatal I/O failure.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        // Build the router before moving the listener out of self.
        let router = self.build_router();
        let shutdown_ctrl = Arc::clone(&self.shutdown);
        let tls = self.config.tls.clone();
        let listener = self
            .listener
            .expect("start() must be called before serve()");

        shutdown_ctrl.set_ready();

        if let Some(tls) = tls {
            serve_tls(listener, router, &tls, shutdown_ctrl, shutdown).await
        } else {
            serve_plain(listener, router, shutdown_ctrl, shutdown).await
        }
    }
}

/// Serves plain HTTP/WS connections using axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown_ctrl: Arc<ShutdownController>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP/WS connections");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    drain(shutdown_ctrl).await;
    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls, reusing the
/// pre-bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &crate::config::TlsConfig,
    shutdown_ctrl: Arc<ShutdownController>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|err| anyhow::anyhow!("failed to load TLS certificates: {err}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!("serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    drain(shutdown_ctrl).await;
    Ok(())
}

/// Flips to Draining and waits for in-flight admin requests to finish.
async fn drain(shutdown_ctrl: Arc<ShutdownController>) {
    shutdown_ctrl.trigger_shutdown();
    if shutdown_ctrl.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("drained cleanly");
    } else {
        warn!("drain timeout expired with in-flight requests remaining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::Hook;
    use crate::registry::testhook::{serial, RecordingHook};
    use crate::registry::BrokerOptions;

    fn module() -> NetworkModule {
        let broker = Broker::new(
            RecordingHook::shared() as Arc<dyn Hook>,
            BrokerOptions::default(),
        )
        .expect("broker");
        NetworkModule::new(broker, NetworkConfig::default())
    }

    #[tokio::test]
    async fn new_creates_module_without_binding() {
        let _serial = serial();
        let module = module();
        assert!(module.listener.is_none());
    }

    #[tokio::test]
    async fn broker_and_controller_are_shared() {
        let _serial = serial();
        let module = module();
        assert!(Arc::ptr_eq(&module.broker(), &module.broker()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn build_router_creates_router() {
        let _serial = serial();
        let module = module();
        let _router = module.build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let _serial = serial();
        let mut module = module();
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }
}
