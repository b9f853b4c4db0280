//! Shared harness for integration tests: scratch upstream servers on
//! ephemeral ports and a proxy bootstrapped from inline YAML.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crossway::server::serve_listener;
use crossway::{Config, ProxyHandler};

pub type TestBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

pub fn full(data: impl Into<Bytes>) -> TestBody {
    Full::new(data.into()).boxed()
}

/// A running proxy bound to an ephemeral port.
pub struct TestProxy {
    pub port: u16,
    pub handler: Arc<ProxyHandler>,
    shutdown: watch::Sender<bool>,
}

impl TestProxy {
    /// Start a proxy from inline YAML. Host rules should use port 0 so
    /// they match the ephemeral listener.
    pub async fn start(yaml: &str) -> Self {
        let config: Config = serde_yaml::from_str(yaml).expect("valid test config");
        config.validate().expect("config validates");
        let handler = Arc::new(ProxyHandler::new(&config).expect("handler builds"));
        handler.start_health_checks();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let serve_handler = Arc::clone(&handler);
        tokio::spawn(async move {
            serve_listener(listener, serve_handler, port, shutdown_rx).await;
        });

        Self {
            port,
            handler,
            shutdown,
        }
    }

    pub fn stop(&self) {
        self.handler.shutdown();
        let _ = self.shutdown.send(true);
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn an upstream that answers every request through `handler`.
pub async fn spawn_upstream<F>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Response<TestBody> + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req)) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// An upstream that echoes the request body back byte-for-byte.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .body(full(body))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// A WebSocket upstream: answers 101 to any request and echoes raw bytes
/// over the upgraded stream.
pub async fn spawn_ws_echo_upstream() -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<Incoming>| async move {
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        let Ok(upgraded) = on_upgrade.await else {
                            return;
                        };
                        let mut io = TokioIo::new(upgraded);
                        let mut buf = [0u8; 8192];
                        loop {
                            match io.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => {
                                    if io.write_all(&buf[..n]).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    });
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::SWITCHING_PROTOCOLS)
                            .header("connection", "Upgrade")
                            .header("upgrade", "websocket")
                            .header("sec-websocket-accept", "test-accept")
                            .body(Empty::<Bytes>::new().boxed())
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

/// An upstream answering 200 with a fixed body on every path.
pub async fn spawn_marker_upstream(marker: &'static str) -> SocketAddr {
    spawn_upstream(move |_req| {
        Response::builder()
            .status(StatusCode::OK)
            .body(full(marker))
            .unwrap()
    })
    .await
}

/// An upstream whose `/health` endpoint reports `health_status` while every
/// other path serves the marker.
pub async fn spawn_upstream_with_health(
    marker: &'static str,
    health_status: StatusCode,
) -> SocketAddr {
    spawn_upstream(move |req| {
        let status = if req.uri().path() == "/health" {
            health_status
        } else {
            StatusCode::OK
        };
        Response::builder()
            .status(status)
            .body(full(marker))
            .unwrap()
    })
    .await
}

/// Body fed by a channel, for event-stream upstreams.
pub struct ChannelTestBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for ChannelTestBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }
}

/// An upstream that streams whatever is pushed into the returned channel
/// as a `text/event-stream` body. Only the first request gets the stream.
pub async fn spawn_sse_upstream() -> (SocketAddr, mpsc::Sender<Bytes>) {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let rx = Arc::new(parking_lot::Mutex::new(Some(rx)));

    let addr = spawn_upstream(move |_req| {
        let rx = rx.lock().take().expect("single streaming request");
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(ChannelTestBody { rx }.boxed())
            .unwrap()
    })
    .await;

    (addr, tx)
}

/// Issue a request through the proxy with full control over the Host
/// header, returning the complete buffered response.
pub async fn proxy_request(
    proxy_port: u16,
    method: &str,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> Response<Bytes> {
    let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(connection);

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("host", host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(body)).unwrap();

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    Response::from_parts(parts, bytes)
}

/// GET through the proxy and return the body as a string.
pub async fn proxy_get(proxy_port: u16, host: &str, path: &str) -> (StatusCode, String) {
    let response = proxy_request(proxy_port, "GET", host, path, &[], Bytes::new()).await;
    let status = response.status();
    let body = String::from_utf8_lossy(response.body()).into_owned();
    (status, body)
}

/// Open a streaming GET through the proxy; returns the response head and
/// the live body for frame-by-frame reads.
pub async fn proxy_get_streaming(
    proxy_port: u16,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> Response<Incoming> {
    let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(connection);

    let mut builder = Request::builder().method("GET").uri(path).header("host", host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    sender
        .send_request(builder.body(Empty::new()).unwrap())
        .await
        .unwrap()
}
