use http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue, PRAGMA};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use serde::Serialize;
use std::error::Error as StdError;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Cache-Control value attached to every error and rate-limit response so
/// intermediaries never cache a transient failure.
pub const NO_CACHE: &str = "no-store, no-cache, must-revalidate, proxy-revalidate";

pub async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, std::io::Error> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening");
    Ok(listener)
}

/// Accepts connections on an already bound listener until `shutdown` flips to
/// true (or its sender is dropped). One service is built per connection so
/// handlers can see the transport peer address.
///
/// Open connections are asked to finish their in-flight requests and close
/// once shutdown is signalled.
pub async fn serve<F, S, E>(
    listener: TcpListener,
    make_service: F,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error>
where
    F: Fn(SocketAddr) -> S,
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
    E: Into<Box<dyn StdError + Send + Sync>> + 'static,
{
    if *shutdown.borrow() {
        return Ok(());
    }

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = make_service(peer_addr);
        let mut conn_shutdown = shutdown.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(io, svc);
            tokio::pin!(conn);

            let result = tokio::select! {
                res = conn.as_mut() => res,
                _ = conn_shutdown.changed() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        });
    }

    tracing::info!("Listener stopped accepting connections");
    Ok(())
}

pub fn full_body<E: 'static>(bytes: impl Into<Bytes>) -> BoxBody<Bytes, E> {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

/// Plain-text response carrying the canonical reason of the status code.
pub fn make_boxed_error_response<E: 'static>(
    status_code: StatusCode,
) -> Response<BoxBody<Bytes, E>> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(full_body(message));
    *response.status_mut() = status_code;
    response
}

/// Serializes `value` as the JSON body of a response with the given status.
pub fn json_response<T, E>(status: StatusCode, value: &T) -> Response<BoxBody<Bytes, E>>
where
    T: Serialize + ?Sized,
    E: 'static,
{
    match serde_json::to_vec(value) {
        Ok(bytes) => raw_json_response(status, Bytes::from(bytes)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response body");
            make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Wraps bytes that are already JSON in a response without re-encoding them.
pub fn raw_json_response<E: 'static>(
    status: StatusCode,
    body: Bytes,
) -> Response<BoxBody<Bytes, E>> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn add_no_cache_headers(headers: &mut HeaderMap) -> &mut HeaderMap {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}
