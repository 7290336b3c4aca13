use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use serde_json::Value;
use shared::http::{full_body, serve};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Clone)]
enum MockBehavior {
    Respond(StatusCode, &'static str),
    Delay(Duration, &'static str),
    /// Answers with `{"jsonrpc":"2.0","id":1,"result":<method>}`
    EchoMethod,
}

/// Local JSON-RPC upstream that records every request it receives.
pub struct MockUpstream {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    _shutdown: watch::Sender<bool>,
}

impl MockUpstream {
    pub async fn respond(status: StatusCode, body: &'static str) -> Self {
        Self::spawn(MockBehavior::Respond(status, body)).await
    }

    pub async fn delayed(delay: Duration, body: &'static str) -> Self {
        Self::spawn(MockBehavior::Delay(delay, body)).await
    }

    pub async fn echo_method() -> Self {
        Self::spawn(MockBehavior::EchoMethod).await
    }

    async fn spawn(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, rx) = watch::channel(false);

        let recorder = received.clone();
        tokio::spawn(serve(
            listener,
            move |_peer| {
                let behavior = behavior.clone();
                let recorder = recorder.clone();
                service_fn(move |req: Request<Incoming>| {
                    handle(behavior.clone(), recorder.clone(), req)
                })
            },
            rx,
        ));

        MockUpstream {
            addr,
            received,
            _shutdown: shutdown,
        }
    }

    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://{}/v2/test-key", self.addr)).unwrap()
    }

    pub fn hits(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Bodies of the requests received so far
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle(
    behavior: MockBehavior,
    received: Arc<Mutex<Vec<Value>>>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody<Bytes, Infallible>>, Infallible> {
    let body = req.into_body().collect().await.unwrap().to_bytes();
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    received.lock().unwrap().push(request.clone());

    let (status, body) = match behavior {
        MockBehavior::Respond(status, body) => (status, body.to_string()),
        MockBehavior::Delay(delay, body) => {
            tokio::time::sleep(delay).await;
            (StatusCode::OK, body.to_string())
        }
        MockBehavior::EchoMethod => {
            let reply = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": request["method"]});
            (StatusCode::OK, reply.to_string())
        }
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    Ok(response)
}
