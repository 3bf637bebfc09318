//! Test server harness for integration tests.
//!
//! Spins up the real queue router on a random port for WebSocket and HTTP
//! clients.

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use queue_server::{app_router, AppState, ServerConfig};

/// A test server instance with control handles.
pub struct TestServer {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a server with default state.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or server fails to bind.
    pub async fn start() -> Self {
        Self::start_with(AppState::default()).await
    }

    /// Start a server that refreshes climb stats from `climb_data_url`.
    #[allow(dead_code)]
    pub async fn start_with_climb_data(climb_data_url: &str) -> Self {
        let config = ServerConfig {
            climb_data_url: Some(climb_data_url.to_string()),
            climb_fetch_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        };
        let state = AppState::from_config(&config).expect("climb data config");
        Self::start_with(state).await
    }

    /// Start a server around `state`.
    pub async fn start_with(state: AppState) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let app = app_router(state.clone())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));

        let listener = TcpListener::bind(addr).await.expect("failed to bind");
        let actual_addr = listener.local_addr().expect("failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            addr: actual_addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Get the WebSocket URL for connecting to the server.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Base HTTP URL.
    #[allow(dead_code)]
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// A WebSocket upgrade request carrying an authenticated user id.
    #[allow(dead_code)]
    pub fn authenticated_request(
        &self,
        user_id: &str,
    ) -> tokio_tungstenite::tungstenite::handshake::client::Request {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = self.ws_url().into_client_request().expect("request");
        request.headers_mut().insert(
            queue_server::identity::USER_ID_HEADER,
            HeaderValue::from_str(user_id).expect("header value"),
        );
        request
    }

    /// Server state for assertions.
    #[allow(dead_code)]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Gracefully shut down the server.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}
