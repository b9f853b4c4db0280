//! HTTP and SSE upstream forwarding.
//!
//! Plain responses are buffered: the upstream body is collected, optionally
//! rewritten by the `replace` rules carried in the context, and delivered
//! with a recomputed length. SSE-flagged contexts switch to streaming mode
//! where every upstream chunk is forwarded the moment it arrives, so no
//! aggregation buffer sits between the origin and the client.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::middleware::{apply_replace_rules, ReplaceRule, RequestContext, REPLACE_RULES_KEY};

/// Response body type shared by every transport path.
pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

/// Value of the `X-Proxy-By` header.
pub const PROXY_NAME: &str = "crossway";

/// Upstream round-trip budget for buffered (non-streaming) requests.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a fixed-size body.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Build an empty body.
pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Build a plain-text response.
pub fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(Bytes::copy_from_slice(message.as_bytes())))
        .unwrap()
}

/// The origin a request is being forwarded to after routing, dynamic
/// rerouting, and backend selection.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Origin URL, scheme + authority.
    pub url: String,
    /// Optional override for the upstream `Host` header.
    pub proxy_host: Option<String>,
    /// Hostname reported in `X-Target-Service`.
    pub service_name: String,
}

/// Forwarding engine with a shared pooled client.
pub struct HttpEngine {
    client: reqwest::Client,
}

impl HttpEngine {
    /// Build the engine and its connection pool.
    pub fn new(dial_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(Error::Upstream)?;
        Ok(Self { client })
    }

    /// Forward the request held in `ctx` to `target` and assemble the
    /// client response.
    ///
    /// # Errors
    ///
    /// Returns an error when the target URL is unparseable or the upstream
    /// round trip fails; callers translate that into a 502 (or an
    /// SSE-framed error event).
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        target: &ResolvedTarget,
    ) -> Result<Response<ProxyBody>> {
        let origin = url::Url::parse(&target.url)
            .map_err(|e| Error::invalid_upstream(&target.url, e))?;
        let host = origin
            .host_str()
            .ok_or_else(|| Error::invalid_upstream(&target.url, "missing host"))?;
        let authority = match origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let outbound_url = format!("{}://{}{}", origin.scheme(), authority, path_and_query);

        let host_header = target.proxy_host.clone().unwrap_or(authority);
        let inbound_host = ctx
            .headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut request = self
            .client
            .request(ctx.method.clone(), &outbound_url)
            .header(hyper::header::HOST, host_header);

        for (name, value) in &ctx.headers {
            if is_hop_by_hop(name.as_str()) || *name == hyper::header::HOST {
                continue;
            }
            request = request.header(name, value);
        }
        request = request
            .header("x-forwarded-proto", "http")
            .header("x-forwarded-host", inbound_host)
            .header("x-forwarded-for", ctx.client_ip());

        if !ctx.body.is_empty() {
            request = request.body(ctx.body.clone());
        }
        if !ctx.sse {
            request = request.timeout(UPSTREAM_TIMEOUT);
        }

        let upstream = request.send().await?;

        debug!(
            target = %outbound_url,
            status = %upstream.status(),
            sse = ctx.sse,
            "Upstream responded"
        );

        let mut builder = Response::builder().status(upstream.status());
        let headers = builder.headers_mut().expect("fresh builder");
        for (name, value) in upstream.headers() {
            // Length and framing are recomputed for whichever body mode
            // we deliver below.
            if is_hop_by_hop(name.as_str()) || *name == hyper::header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        headers.insert(
            HeaderName::from_static("x-proxy-by"),
            HeaderValue::from_static(PROXY_NAME),
        );
        if let Ok(value) = HeaderValue::from_str(&target.service_name) {
            headers.insert(HeaderName::from_static("x-target-service"), value);
        }
        for (name, value) in &ctx.response_headers {
            headers.insert(name.clone(), value.clone());
        }

        let body = if ctx.sse {
            streaming_body(upstream)
        } else {
            let mut bytes = upstream.bytes().await?;
            if let Some(rules) = ctx.value::<Arc<Vec<ReplaceRule>>>(REPLACE_RULES_KEY) {
                bytes = Bytes::from(apply_replace_rules(&bytes, rules));
            }
            full_body(bytes)
        };

        Ok(builder.body(body).expect("valid response parts"))
    }

    /// The 502 answer for an upstream transport failure. SSE-flagged
    /// contexts get a single event-stream-framed error instead of a plain
    /// body, so stream consumers see a well-formed event.
    pub fn error_response(ctx: &RequestContext) -> Response<ProxyBody> {
        if ctx.sse {
            let mut builder = Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache");
            if let Some(headers) = builder.headers_mut() {
                for (name, value) in &ctx.response_headers {
                    headers.insert(name.clone(), value.clone());
                }
            }
            return builder
                .body(full_body(Bytes::from_static(
                    b"event: error\ndata: Service unavailable\n\n",
                )))
                .unwrap();
        }

        text_response(StatusCode::BAD_GATEWAY, "Service unavailable")
    }
}

/// Relay an upstream body chunk-for-chunk. Each chunk is handed to the
/// connection as its own frame the moment it arrives, so hyper writes and
/// flushes upstream events without aggregation. The single-slot channel
/// keeps at most one chunk in flight between the puller and the writer.
fn streaming_body(upstream: reqwest::Response) -> ProxyBody {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(1);

    tokio::spawn(async move {
        let mut upstream = upstream;
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        // Client went away.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx
                        .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                        .await;
                    break;
                }
            }
        }
    });

    ChannelBody { rx }.boxed()
}

/// Body backed by a chunk channel; ends when the sender is dropped.
struct ChannelBody {
    rx: mpsc::Receiver<std::io::Result<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::io::Result<Frame<Bytes>>>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|result| result.map(Frame::data)))
    }
}

/// Hop-by-hop headers are connection-scoped and never forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
