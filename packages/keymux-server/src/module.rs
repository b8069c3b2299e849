//! Storage server with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation lets the caller mount additional drivers
//! or capture shared handles between `start()` and `serve()`.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use keymux_core::Storage;

use crate::config::ServerConfig;
use crate::drain::RequestTracker;
use crate::handlers::{storage_handler, AppState, Authorize, PathResolver};
use crate::middleware::build_http_layers;

/// Manages the HTTP server lifecycle around a [`Storage`] engine.
///
/// 1. `new()` -- allocates shared state (storage handle, request
///    tracker)
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- accepts connections until shutdown is signalled
pub struct StorageServer {
    config: ServerConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl StorageServer {
    /// Creates a server over `storage` without binding any port.
    #[must_use]
    pub fn new(storage: Arc<Storage>, config: ServerConfig) -> Self {
        Self {
            config,
            listener: None,
            state: AppState {
                storage,
                tracker: Arc::new(RequestTracker::new()),
                authorize: None,
                resolve_path: None,
            },
        }
    }

    /// Installs the authorization hook consulted before every dispatch.
    #[must_use]
    pub fn with_authorize(mut self, authorize: Arc<dyn Authorize>) -> Self {
        self.state.authorize = Some(authorize);
        self
    }

    /// Installs the request-path rewriting hook.
    #[must_use]
    pub fn with_path_resolver(mut self, resolve: PathResolver) -> Self {
        self.state.resolve_path = Some(resolve);
        self
    }

    /// Returns a shared reference to the in-flight request tracker.
    #[must_use]
    pub fn request_tracker(&self) -> Arc<RequestTracker> {
        Arc::clone(&self.state.tracker)
    }

    /// Returns a shared reference to the served storage engine.
    #[must_use]
    pub fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.state.storage)
    }

    /// Assembles the axum router: one fallback handler owning the whole
    /// path space, behind the transport middleware stack.
    #[must_use]
    pub fn build_router(&self) -> Router {
        Router::new()
            .fallback(storage_handler)
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the
    /// configured port when port 0 is used (OS-assigned).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g. port in
    /// use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("storage server bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until the shutdown future resolves, then drains
    /// in-flight requests.
    ///
    /// Consumes `self` because the listener is moved into the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let tracker = Arc::clone(&self.state.tracker);
        let drain_timeout = self.config.drain_timeout;

        let router = Router::new()
            .fallback(storage_handler)
            .layer(build_http_layers(&self.config))
            .with_state(self.state);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        if tracker.drain(drain_timeout).await {
            info!("storage server drained cleanly");
        } else {
            warn!(
                in_flight = tracker.active(),
                "drain timeout expired with requests still running"
            );
        }
        Ok(())
    }
}
