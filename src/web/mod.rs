//! HTTP gateway: routes each request to the right workload container by the
//! leftmost host label, authenticating through the identity cookie.

mod proxy;

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::any;
use axum::Router;
use tracing::info;

use crate::core::{ImageRegistry, UserRegistry};
use crate::shutdown::ShutdownController;

pub struct WebState {
    pub images: Arc<ImageRegistry>,
    pub users: Arc<UserRegistry>,
    pub shutdown: ShutdownController,
    pub http: reqwest::Client,
    /// Name of the cookie carrying the web token.
    pub identity_cookie: String,
    /// Login redirect target; `{}` receives the url-encoded original URL.
    pub login_url_format: String,
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new().fallback(any(proxy::handle)).with_state(state)
}

/// Serves the gateway until shutdown: stops accepting on Requested, aborts
/// in-flight requests on Demanded.
pub async fn serve(state: Arc<WebState>, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("http gateway listening on {addr}");

    let shutdown = state.shutdown.clone();
    let job = shutdown.job();
    let app = router(state);

    let graceful = {
        let shutdown = shutdown.clone();
        async move { shutdown.requested().await }
    };
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .into_future();
    let token = shutdown.shutdown_token();
    let result = tokio::select! {
        result = server => result.map_err(Into::into),
        _ = token.cancelled() => Ok(()),
    };
    drop(job);
    result
}
