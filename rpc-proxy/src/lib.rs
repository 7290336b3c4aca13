pub mod chains;
pub mod config;
pub mod csrf;
pub mod errors;
pub mod forwarder;
pub mod handler;
pub mod identity;
pub mod jsonrpc;
pub mod metrics_defs;
pub mod rate_limiter;

#[cfg(test)]
mod testutils;

use crate::errors::{RpcProxyError, StartupError};
use crate::handler::{Gateway, ProxyBody};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use shared::admin_service::AdminService;
use shared::http::{bind_listener, serve};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Runs the gateway and admin listeners until `shutdown` flips to true.
///
/// `api_key` is the upstream provider key; chains whose URL needs it are not
/// served when it is absent.
pub async fn run(
    config: config::Config,
    api_key: Option<String>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), StartupError> {
    let gateway = Arc::new(Gateway::from_config(&config, api_key.as_deref())?);
    let ready = Arc::new(AtomicBool::new(false));

    let proxy_listener = bind_listener(&config.listener.host, config.listener.port).await?;
    let admin_listener =
        bind_listener(&config.admin_listener.host, config.admin_listener.port).await?;

    let sweeper = gateway.limiter().start_sweeper();

    let proxy_gateway = gateway.clone();
    let proxy_task = serve(
        proxy_listener,
        move |peer| RpcProxyService::new(proxy_gateway.clone(), peer),
        shutdown.clone(),
    );

    let admin_ready = ready.clone();
    let admin_task = serve(
        admin_listener,
        move |_peer| {
            let ready = admin_ready.clone();
            AdminService::new(move || ready.load(Ordering::Relaxed))
        },
        shutdown,
    );

    ready.store(true, Ordering::Relaxed);
    tracing::info!("RPC proxy ready");

    let result = tokio::try_join!(proxy_task, admin_task);
    ready.store(false, Ordering::Relaxed);
    sweeper.shutdown().await;
    tracing::info!("RPC proxy stopped");

    result?;
    Ok(())
}

/// Per-connection service; carries the transport peer address used as the
/// last-resort client identity.
struct RpcProxyService {
    gateway: Arc<Gateway>,
    peer: SocketAddr,
}

impl RpcProxyService {
    fn new(gateway: Arc<Gateway>, peer: SocketAddr) -> Self {
        RpcProxyService { gateway, peer }
    }
}

impl Service<Request<Incoming>> for RpcProxyService {
    type Response = Response<ProxyBody>;
    type Error = RpcProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.gateway.clone();
        let peer = self.peer;
        Box::pin(async move { Ok(gateway.handle(req, Some(peer)).await) })
    }
}
