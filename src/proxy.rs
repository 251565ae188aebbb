//! Front proxy: a single stable listener that forwards to the active
//! backend generation, performs the cutover swap, and serves the admin
//! and developer error pages.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::RwLock;
use regex::Regex;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::build::now_unix;
use crate::pages;
use crate::supervisor::Supervisor;
use crate::watcher::Watcher;

/// How long responses carry the `X-Server-Upgraded` header after a cutover.
const UPGRADE_HEADER_TTL_SECS: i64 = 3600;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn static_asset_regex() -> Regex {
    Regex::new(r"\.(png|jpg|jpeg|gif|svg|ico|swf|js|css|html|woff)")
        .expect("valid static asset pattern")
}

/// The main reverse proxy server.
pub struct Proxy {
    port: String,
    supervisor: Arc<Supervisor>,
    watcher: Arc<Watcher>,
    client: Client<HttpConnector, ProxyBody>,
    /// The upstream target currently forwarded to; rebuilt when the
    /// supervisor signals a cutover.
    upstream_port: RwLock<String>,
    upgraded: AtomicI64,
    admin_pwd: String,
    admin_ips: Vec<String>,
    log_requests: bool,
    static_assets: Regex,
}

impl Proxy {
    pub fn new(
        port: String,
        supervisor: Arc<Supervisor>,
        watcher: Arc<Watcher>,
        admin_pwd: String,
        admin_ips: Vec<String>,
        log_requests: bool,
    ) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);
        Arc::new(Self {
            port,
            supervisor,
            watcher,
            client,
            upstream_port: RwLock::new(String::new()),
            upgraded: AtomicI64::new(0),
            admin_pwd,
            admin_ips,
            log_requests,
            static_assets: static_asset_regex(),
        })
    }

    /// Bind the front port and serve until the process exits.
    pub async fn listen(self: Arc<Self>) -> anyhow::Result<()> {
        *self.upstream_port.write() = self.supervisor.active_port();
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port)
            .parse()
            .map_err(|e| anyhow!("invalid proxy port {}: {e}", self.port))?;
        let listener = TcpListener::bind(addr).await?;
        info!(
            port = %self.port,
            upstream = %self.upstream_port.read(),
            "proxy listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { Ok::<_, Infallible>(proxy.handle(req, peer).await) }
                });
                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(io, service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "connection error");
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();
        match path.as_str() {
            "/tower-proxy/watch/pause" => self.admin_toggle(&req, &peer, true),
            "/tower-proxy/watch/begin" => self.admin_toggle(&req, &peer, false),
            "/tower-proxy/watch" => {
                let status = if self.watcher.paused() { "Pause" } else { "OK" };
                text_response(StatusCode::OK, format!("watch status: {status}"))
            }
            _ => self.serve_request(req).await,
        }
    }

    fn admin_toggle(
        &self,
        req: &Request<Incoming>,
        peer: &SocketAddr,
        pause: bool,
    ) -> Response<ProxyBody> {
        let pwd = query_param(req.uri().query(), "pwd");
        let body = if admin_allowed(&pwd, &self.admin_pwd, &client_host(peer), &self.admin_ips) {
            self.watcher.set_paused(pause);
            info!(paused = pause, "watch state changed by admin");
            "done"
        } else {
            // Returned with 200 OK, preserved for client compatibility.
            "Authentication failed"
        };
        text_response(StatusCode::OK, body.to_string())
    }

    async fn serve_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let start = Instant::now();
        let uri_text = req.uri().to_string();
        let log = self.log_requests && !self.static_assets.is_match(&uri_text);
        let req = if log {
            match self.buffer_and_log(req).await {
                Ok(req) => req,
                Err(resp) => return resp,
            }
        } else {
            req.map(|b| b.boxed())
        };

        let sup = &self.supervisor;
        let resp = if sup.take_switch() {
            let old = self.upstream_port.read().clone();
            let new = sup.active_port();
            info!(from = %old, to = %new, "switching upstream port");
            *self.upstream_port.write() = new;
            // First request on the new generation: forward it, stamp the
            // upgrade time, and retire prior generations in the background.
            let resp = self.forward(req).await;
            self.upgraded.store(now_unix(), Ordering::SeqCst);
            let sup = Arc::clone(&self.supervisor);
            tokio::spawn(async move { sup.clean().await });
            resp
        } else if !sup.is_running_active() || self.watcher.changed() {
            self.watcher.reset();
            match sup.restart().await {
                Err(e) => pages::build_error(sup.name(), &format!("{e:#}")),
                Ok(()) => self.forward(req).await,
            }
        } else {
            self.forward(req).await
        };

        let last_error = sup.last_error();
        let mut resp = if !last_error.is_empty() {
            sup.clear_last_error();
            pages::app_error(sup.name(), &last_error)
        } else if sup.is_quit_active() {
            info!("app quit unexpectedly");
            if let Err(e) = sup.start(false, None).await {
                error!(error = %e, "failed to relaunch after unexpected quit");
            }
            pages::quit_error(sup.name())
        } else {
            resp
        };

        let upgraded = self.upgraded.load(Ordering::SeqCst);
        if upgraded > 0 {
            let secs = now_unix() - upgraded;
            if secs > UPGRADE_HEADER_TTL_SECS {
                self.upgraded.store(0, Ordering::SeqCst);
            } else if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert("X-Server-Upgraded", value);
            }
        }

        if log {
            info!(
                status = resp.status().as_u16(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "request completed"
            );
        }
        resp
    }

    /// Buffer the body so form parameters can be logged without consuming
    /// the request, then hand back a replayable request.
    async fn buffer_and_log(
        &self,
        req: Request<Incoming>,
    ) -> Result<Request<ProxyBody>, Response<ProxyBody>> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let is_form = req
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        let (parts, body) = req.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return Err(text_response(
                    StatusCode::BAD_REQUEST,
                    format!("failed to read request body: {e}"),
                ))
            }
        };
        info!(method = %method, uri = %uri, "request started");
        let params = format_params(uri.query(), &bytes, is_form);
        if !params.is_empty() {
            info!(params = %params, "request parameters");
        }
        Ok(Request::from_parts(
            parts,
            Full::new(bytes).map_err(|never| match never {}).boxed(),
        ))
    }

    /// Forward a request to the current upstream target.
    async fn forward(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let port = self.upstream_port.read().clone();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let uri = format!("http://127.0.0.1:{port}{path_and_query}");
        let (mut parts, body) = req.into_parts();
        parts.uri = match uri.parse() {
            Ok(uri) => uri,
            Err(e) => {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("invalid upstream uri: {e}"),
                )
            }
        };
        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                error!(port = %port, error = %e, "failed to reach backend");
                text_response(
                    StatusCode::BAD_GATEWAY,
                    format!("failed to reach backend on port {port}: {e}"),
                )
            }
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Admin authentication predicate.
///
/// TODO: tighten to `!pwd.is_empty() && pwd == admin_pwd`; today any
/// non-empty password is accepted, which existing tooling relies on.
fn admin_allowed(pwd: &str, admin_pwd: &str, client_host: &str, allow_ips: &[String]) -> bool {
    if !pwd.is_empty() || pwd == admin_pwd {
        return true;
    }
    allow_ips.iter().any(|ip| ip == client_host)
}

/// Host portion of the peer address; IPv6 comes back without brackets.
fn client_host(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

fn query_param(query: Option<&str>, key: &str) -> String {
    let Some(query) = query else {
        return String::new();
    };
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return v.to_string();
        }
    }
    String::new()
}

fn format_params(query: Option<&str>, body: &[u8], is_form: bool) -> String {
    fn absorb(params: &mut BTreeMap<String, Vec<String>>, pairs: &str) {
        for pair in pairs.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            params.entry(k.to_string()).or_default().push(v.to_string());
        }
    }

    let mut params = BTreeMap::new();
    if let Some(query) = query {
        absorb(&mut params, query);
    }
    if is_form {
        if let Ok(text) = std::str::from_utf8(body) {
            absorb(&mut params, text);
        }
    }
    params
        .into_iter()
        .map(|(key, values)| {
            let values = values
                .iter()
                .map(|v| format!("\"{v}\""))
                .collect::<Vec<_>>()
                .join(", ");
            format!("\"{key}\":[{values}]")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
