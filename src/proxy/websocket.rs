//! WebSocket tunneling.
//!
//! Upgrade flow: take over the client connection via hyper's upgrade
//! mechanism, dial the upstream (TCP for `ws`, TLS for `wss`), replay the
//! handshake with a filtered header set, require a 101 from the upstream,
//! relay that 101 to the client, then join both upgraded streams with a
//! bidirectional byte copy until the first error on either leg.
//!
//! Live tunnels are registered for inspection and for close-all at
//! shutdown; a tunnel deregisters itself when either direction ends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lb::ConnectionGuard;
use crate::middleware::RequestContext;

use super::http::{empty_body, ProxyBody};

/// Copy buffer size per tunnel direction.
const TUNNEL_BUFFER: usize = 32 * 1024;

/// Headers replayed to the upstream during the handshake. Everything else
/// the client sent is dropped.
const HANDSHAKE_HEADERS: [&str; 10] = [
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
    "origin",
    "user-agent",
    "cookie",
    "authorization",
];

type BoxedStream = Pin<Box<dyn AsyncReadWrite + Send>>;

trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Whether the request is an RFC 6455 upgrade: `Connection` lists
/// `upgrade`, `Upgrade` is `websocket`, version 13, non-empty key.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrades = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    if !connection_upgrades {
        return false;
    }

    let upgrade_is_websocket = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_is_websocket {
        return false;
    }

    if headers
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        != Some("13")
    {
        return false;
    }

    headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.is_empty())
}

/// A live tunnel's bookkeeping entry.
struct TunnelHandle {
    started_at: Instant,
    abort: AbortHandle,
}

/// WebSocket tunnel engine and registry.
pub struct WebSocketProxy {
    dial_timeout: Duration,
    tls: TlsConnector,
    tunnels: RwLock<HashMap<String, TunnelHandle>>,
    sequence: AtomicU64,
}

impl WebSocketProxy {
    /// Build the engine. Certificate verification for `wss` upstreams is on
    /// unless `insecure_skip_verify` explicitly opts out.
    pub fn new(dial_timeout: Duration, insecure_skip_verify: bool) -> Self {
        let tls_config = if insecure_skip_verify {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new()))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Self {
            dial_timeout,
            tls: TlsConnector::from(Arc::new(tls_config)),
            tunnels: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.read().len()
    }

    /// Abort every live tunnel, closing both sockets of each pair.
    pub fn close_all(&self) {
        let mut tunnels = self.tunnels.write();
        for (id, handle) in tunnels.drain() {
            debug!(id = %id, age = ?handle.started_at.elapsed(), "Closing tunnel");
            handle.abort.abort();
        }
    }

    /// Proxy an upgrade request to `target_url`.
    ///
    /// On success the returned response is the upstream's 101 relayed to
    /// the client; the tunnel task keeps running in the background and
    /// holds the balancer's connection guard for its lifetime.
    ///
    /// # Errors
    ///
    /// Any failure before the 101 is relayed (dial, TLS, handshake, non-101
    /// answer) is returned to the caller, which responds 502; nothing has
    /// been written to the client yet at that point.
    pub async fn proxy(
        self: &Arc<Self>,
        ctx: &RequestContext,
        target_url: &str,
        on_upgrade: OnUpgrade,
        guard: Option<ConnectionGuard>,
    ) -> Result<Response<ProxyBody>> {
        let target = url::Url::parse(target_url)
            .map_err(|e| Error::invalid_upstream(target_url, e))?;

        let use_tls = matches!(target.scheme(), "https" | "wss");
        let host = target
            .host_str()
            .ok_or_else(|| Error::invalid_upstream(target_url, "missing host"))?
            .to_string();
        let port = target.port().unwrap_or(if use_tls { 443 } else { 80 });

        let stream = self.dial(&host, port, use_tls).await?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| Error::Handshake(format!("upstream connection setup: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.with_upgrades().await {
                debug!(error = %e, "Upstream websocket connection ended");
            }
        });

        let request = self.build_handshake_request(ctx, &host, port)?;
        let upstream_response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Handshake(format!("upstream handshake send: {e}")))?;

        if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::Handshake(format!(
                "unexpected upstream status: {}",
                upstream_response.status()
            )));
        }

        // Relay the upstream's 101 verbatim; the handshake headers
        // (Sec-WebSocket-Accept and friends) must reach the client.
        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        if let Some(headers) = response.headers_mut() {
            for (name, value) in upstream_response.headers() {
                headers.append(name.clone(), value.clone());
            }
        }
        let response = response.body(empty_body()).expect("valid 101 response");

        let id = format!(
            "{}-{}-{}",
            ctx.remote_addr,
            ctx.headers
                .get("sec-websocket-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("nokey"),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );

        let registry = Arc::clone(self);
        let tunnel_id = id.clone();
        let task = tokio::spawn(async move {
            // Guard lives exactly as long as the tunnel.
            let _guard = guard;

            let result = run_tunnel(upstream_response, on_upgrade).await;
            match result {
                Ok((to_upstream, to_client)) => {
                    info!(
                        id = %tunnel_id,
                        bytes_to_upstream = to_upstream,
                        bytes_to_client = to_client,
                        "Tunnel closed"
                    );
                }
                Err(e) => {
                    debug!(id = %tunnel_id, error = %e, "Tunnel ended with error");
                }
            }
            registry.tunnels.write().remove(&tunnel_id);
        });

        self.tunnels.write().insert(
            id,
            TunnelHandle {
                started_at: Instant::now(),
                abort: task.abort_handle(),
            },
        );

        Ok(response)
    }

    async fn dial(&self, host: &str, port: u16, use_tls: bool) -> Result<BoxedStream> {
        let tcp = tokio::time::timeout(self.dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Handshake(format!("dial timeout connecting to {host}:{port}")))?
            .map_err(|e| Error::io(format!("dialing {host}:{port}"), e))?;

        if !use_tls {
            return Ok(Box::pin(tcp));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::Handshake(format!("invalid TLS server name '{host}': {e}")))?;
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::io(format!("TLS handshake with {host}:{port}"), e))?;
        Ok(Box::pin(tls))
    }

    fn build_handshake_request(
        &self,
        ctx: &RequestContext,
        host: &str,
        port: u16,
    ) -> Result<Request<Empty<Bytes>>> {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder()
            .method(hyper::Method::GET)
            .uri(path_and_query)
            .header(hyper::header::HOST, format!("{host}:{port}"));

        if let Some(headers) = builder.headers_mut() {
            for name in HANDSHAKE_HEADERS {
                let name = HeaderName::from_static(name);
                if let Some(value) = ctx.headers.get(&name) {
                    headers.insert(name, value.clone());
                }
            }
            headers.insert(
                HeaderName::from_static("x-forwarded-proto"),
                HeaderValue::from_static("http"),
            );
            if let Ok(value) = HeaderValue::from_str(ctx.host()) {
                headers.insert(HeaderName::from_static("x-forwarded-host"), value);
            }
            if let Ok(value) = HeaderValue::from_str(&ctx.client_ip()) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        builder
            .body(Empty::new())
            .map_err(|e| Error::Handshake(format!("building handshake request: {e}")))
    }
}

/// Join the two upgraded streams until either side errors or closes.
/// Returns the byte counts moved in each direction.
async fn run_tunnel(
    upstream_response: Response<hyper::body::Incoming>,
    on_upgrade: OnUpgrade,
) -> std::io::Result<(u64, u64)> {
    let upstream = hyper::upgrade::on(upstream_response)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let client = on_upgrade
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    let mut client_io = TokioIo::new(client);
    let mut upstream_io = TokioIo::new(upstream);

    tokio::io::copy_bidirectional_with_sizes(
        &mut client_io,
        &mut upstream_io,
        TUNNEL_BUFFER,
        TUNNEL_BUFFER,
    )
    .await
}

mod danger {
    //! Opt-in certificate verification bypass for `wss` upstreams with
    //! self-signed or mismatched certificates.

    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    pub(super) struct NoVerification(rustls::crypto::CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
