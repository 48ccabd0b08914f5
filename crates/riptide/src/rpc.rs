//! The HTTP+JSON control plane.
//!
//! One POST endpoint speaks the JSON-RPC dialect
//! (`{"method", "arguments", "tag"}`), a static handler serves the web
//! UI, and a guard stack in front enforces, in order: brute-force
//! lockout, address whitelist, CORS pre-flight, basic auth, host-header
//! validation and the session-id anti-CSRF check.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value as Json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::blocklist::Blocklist;
use crate::session::{AddTorrent, AddTorrentOptions, Session};
use crate::torrent::{Activity, Priority, TorrentId};

pub const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";
const SESSION_ID_LEN: usize = 48;
const RPC_VERSION: u32 = 17;

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub bind_addr: SocketAddr,
    /// When set (unix targets), serve on this socket path instead of
    /// TCP. Connections are local by definition, so the address
    /// whitelist does not apply.
    pub unix_socket_path: Option<PathBuf>,
    /// Prefix for both endpoints: `<prefix>rpc` and `<prefix>web/`.
    pub url_prefix: String,
    pub username: Option<String>,
    /// SSHA1 of the password, as produced by [`cryptow::ssha1`].
    pub password_ssha1: Option<String>,
    pub auth_required: bool,
    pub whitelist_enabled: bool,
    pub whitelist: Vec<String>,
    pub host_whitelist: Vec<String>,
    pub anti_brute_force_enabled: bool,
    pub anti_brute_force_limit: u32,
    pub web_ui_dir: Option<PathBuf>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], 9091).into(),
            unix_socket_path: None,
            url_prefix: "/transmission/".to_owned(),
            username: None,
            password_ssha1: None,
            auth_required: false,
            whitelist_enabled: true,
            whitelist: vec!["127.0.0.1".to_owned(), "::1".to_owned()],
            host_whitelist: Vec::new(),
            anti_brute_force_enabled: false,
            anti_brute_force_limit: 100,
            web_ui_dir: None,
        }
    }
}

/// Shell-style wildcard match: `*` spans anything, `?` one character.
/// The dialect whitelists have used since forever.
pub fn wildmat(text: &str, pattern: &str) -> bool {
    fn inner(t: &[u8], p: &[u8]) -> bool {
        match (t.first(), p.first()) {
            (_, None) => t.is_empty(),
            (_, Some(b'*')) => inner(t, &p[1..]) || (!t.is_empty() && inner(&t[1..], p)),
            (None, _) => false,
            (Some(tc), Some(b'?')) => {
                let _ = tc;
                inner(&t[1..], &p[1..])
            }
            (Some(tc), Some(pc)) => tc == pc && inner(&t[1..], &p[1..]),
        }
    }
    inner(text.as_bytes(), pattern.as_bytes())
}

fn generate_session_id() -> String {
    const POOL: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut buf = [0u8; SESSION_ID_LEN];
    cryptow::random_fill(&mut buf);
    buf.iter()
        .map(|b| POOL[*b as usize % POOL.len()] as char)
        .collect()
}

pub struct RpcServer {
    session: Arc<Session>,
    config: RpcConfig,
    session_id: String,
    login_attempts: AtomicU32,
}

impl RpcServer {
    pub fn new(session: Arc<Session>, config: RpcConfig) -> Arc<Self> {
        Arc::new(Self {
            session,
            config,
            session_id: generate_session_id(),
            login_attempts: AtomicU32::new(0),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn router(self: &Arc<Self>) -> Router {
        let prefix = self.config.url_prefix.trim_end_matches('/');
        Router::new()
            .route(&format!("{prefix}/rpc"), post(handle_rpc).get(method_not_allowed))
            .route(&format!("{prefix}/web/"), get(handle_web_index))
            .route(&format!("{prefix}/web/{{*path}}"), get(handle_web))
            .layer(middleware::from_fn_with_state(self.clone(), guard))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Bind and serve forever. Bind failures are retried up to 10 times
    /// with a growing delay.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        #[cfg(unix)]
        if let Some(path) = self.config.unix_socket_path.clone() {
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path)
                .with_context(|| format!("couldn't bind rpc socket {path:?}"))?;
            info!(?path, "rpc server listening on unix socket");
            let app = self.router().into_make_service();
            return axum::serve(listener, app).await.context("rpc server died");
        }
        let listener = bind_with_retry(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "rpc server listening");
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).await.context("rpc server died")
    }
}

async fn bind_with_retry(addr: SocketAddr) -> anyhow::Result<tokio::net::TcpListener> {
    let mut last_err = None;
    for attempt in 1..=10u64 {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                let delay = Duration::from_secs((5 * attempt).min(60));
                warn!(%addr, attempt, "bind failed ({e}), retrying in {delay:?}");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(last_err.unwrap()).context("couldn't bind rpc socket")
}

fn plain(status: StatusCode, message: &str) -> Response {
    (status, message.to_owned()).into_response()
}

fn host_is_allowed(host: &str, whitelist: &[String]) -> bool {
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    whitelist.iter().any(|p| wildmat(host, p))
}

async fn guard(State(srv): State<Arc<RpcServer>>, req: Request, next: Next) -> Response {
    let config = &srv.config;

    // 1. lockout after too many failed logins
    if config.anti_brute_force_enabled
        && srv.login_attempts.load(Ordering::Relaxed) >= config.anti_brute_force_limit
    {
        return plain(
            StatusCode::FORBIDDEN,
            "Too many unsuccessful login attempts. Please restart the server to continue logging in.",
        );
    }

    // 2. address whitelist, matched on the text form. Unix-socket
    // connections carry no peer address and are inherently local.
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0);
    if config.whitelist_enabled {
        if let Some(remote) = remote {
            let remote_text = remote.ip().to_string();
            if !config.whitelist.iter().any(|p| wildmat(&remote_text, p)) {
                debug!(%remote, "rejected by whitelist");
                return plain(StatusCode::FORBIDDEN, "Forbidden by address whitelist");
            }
        }
    }

    // 3. CORS pre-flight short-circuits before auth
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
        if let Some(requested) = req.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
        return response;
    }

    // 4. basic auth
    let auth_on = config.username.is_some() && config.auth_required;
    if auth_on && !check_basic_auth(config, req.headers()) {
        srv.login_attempts.fetch_add(1, Ordering::Relaxed);
        let mut response = plain(StatusCode::UNAUTHORIZED, "Unauthorized User");
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"Transmission\""),
        );
        return response;
    }
    if auth_on {
        srv.login_attempts.store(0, Ordering::Relaxed);
    }

    // 5. host-header check guards DNS rebinding; password auth already
    // proves the caller is legitimate
    if !auth_on {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if !host_is_allowed(host, &config.host_whitelist) {
            return plain(
                StatusCode::MISDIRECTED_REQUEST,
                "Transmission received your request, but the hostname was unrecognized.\n\
                 To fix this, choose one of the following options:\n\
                 - Use the IP address directly.\n\
                 - Add the hostname to the host whitelist.\n",
            );
        }
    }

    // 6. session-id check on everything that isn't a pre-flight
    let presented = req
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|h| h.to_str().ok());
    if presented != Some(srv.session_id.as_str()) {
        let mut response = plain(StatusCode::CONFLICT, "invalid session-id header");
        if let Ok(v) = HeaderValue::from_str(&srv.session_id) {
            response.headers_mut().insert(SESSION_ID_HEADER, v);
        }
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    if let Ok(v) = HeaderValue::from_str(&srv.session_id) {
        headers.insert(SESSION_ID_HEADER, v);
    }
    response
}

fn check_basic_auth(config: &RpcConfig, headers: &HeaderMap) -> bool {
    let (Some(expected_user), Some(expected_pass)) =
        (&config.username, &config.password_ssha1)
    else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Some(decoded) = cryptow::base64_decode(encoded) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = text.split_once(':') else {
        return false;
    };
    user == expected_user && cryptow::ssha1_matches(expected_pass, pass)
}

async fn method_not_allowed() -> Response {
    plain(
        StatusCode::METHOD_NOT_ALLOWED,
        "rpc requests must be POSTed",
    )
}

// --- the JSON-RPC endpoint ---

async fn handle_rpc(
    State(srv): State<Arc<RpcServer>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: Json = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return json_response(
                &json!({"result": format!("couldn't parse request: {e}")}),
                &headers,
            )
            .await
        }
    };
    let method = request.get("method").and_then(Json::as_str).unwrap_or("");
    let arguments = request.get("arguments").cloned().unwrap_or(json!({}));
    let tag = request.get("tag").cloned();

    debug!(method, "rpc call");
    let (result, response_args) = match dispatch(&srv.session, method, &arguments).await {
        Ok(args) => ("success".to_owned(), args),
        Err(message) => (message, json!({})),
    };

    let mut response = json!({
        "result": result,
        "arguments": response_args,
    });
    if let Some(tag) = tag {
        response["tag"] = tag;
    }
    json_response(&response, &headers).await
}

// Serialise, gzip when the client accepts it and it actually helps.
async fn json_response(value: &Json, request_headers: &HeaderMap) -> Response {
    let raw = serde_json::to_vec(value).unwrap_or_default();
    let accepts_gzip = request_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));

    if accepts_gzip {
        let mut encoder =
            async_compression::tokio::write::GzipEncoder::new(Vec::with_capacity(raw.len()));
        let compressed = async {
            encoder.write_all(&raw).await.ok()?;
            encoder.shutdown().await.ok()?;
            Some(encoder.into_inner())
        }
        .await;
        if let Some(compressed) = compressed {
            if compressed.len() < raw.len() {
                return Response::builder()
                    .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Body::from(compressed))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        }
    }
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json; charset=UTF-8")
        .body(Body::from(raw))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn activity_to_status(activity: Activity) -> u8 {
    match activity {
        Activity::Stopped => 0,
        Activity::CheckWait => 1,
        Activity::Check => 2,
        Activity::DownloadWait => 3,
        Activity::Download => 4,
        Activity::SeedWait => 5,
        Activity::Seed => 6,
    }
}

fn selected_ids(session: &Session, args: &Json) -> Vec<TorrentId> {
    match args.get("ids") {
        None | Some(Json::Null) => session.torrent_ids(),
        Some(Json::Number(n)) => n.as_u64().map(|v| v as TorrentId).into_iter().collect(),
        Some(Json::String(_)) => session.torrent_ids(),
        Some(Json::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Json::Number(n) => n.as_u64().map(|v| v as TorrentId),
                Json::String(s) => s
                    .parse::<riptide_core::Id20>()
                    .ok()
                    .and_then(|h| session.find_by_info_hash(&h)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn torrent_json(session: &Session, id: TorrentId) -> Option<Json> {
    let torrent = session.resolve(id)?;
    let t = torrent.read();
    let total = t.metainfo.block_info.total_size();
    let have = t.have_bytes();
    Some(json!({
        "id": t.id,
        "name": t.metainfo.name,
        "hashString": t.info_hash_str(),
        "status": activity_to_status(t.activity),
        "totalSize": total,
        "haveValid": have,
        "percentDone": if total == 0 { 0.0 } else { have as f64 / total as f64 },
        "downloadDir": t.download_dir.to_string_lossy(),
        "uploadedEver": t.uploaded.ever,
        "downloadedEver": t.downloaded.ever,
        "corruptEver": t.corrupt.ever,
        "error": t.error.kind,
        "errorString": t.error.message,
        "queuePosition": t.queue_position,
        "isFinished": t.is_finished,
        "labels": t.labels.iter().map(|l| l.to_string()).collect::<Vec<_>>(),
        "bandwidthPriority": match t.priority {
            Priority::Low => -1,
            Priority::Normal => 0,
            Priority::High => 1,
        },
        "addedDate": t.date_added,
        "doneDate": t.date_done,
        "activityDate": t.date_active,
        "pieceCount": t.n_pieces(),
        "pieceSize": t.metainfo.block_info.piece_size(),
    }))
}

async fn dispatch(session: &Arc<Session>, method: &str, args: &Json) -> Result<Json, String> {
    match method {
        "session-get" => {
            let config = session.config();
            Ok(json!({
                "version": crate::version(),
                "rpc-version": RPC_VERSION,
                "rpc-version-minimum": 14,
                "download-dir": config.download_dir.to_string_lossy(),
                "incomplete-dir-enabled": config.incomplete_dir.is_some(),
                "incomplete-dir": config.incomplete_dir
                    .as_deref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                "peer-port": config.peer_port,
                "queue-stalled-enabled": false,
                "download-queue-enabled": config.queue_enabled,
                "download-queue-size": config.download_queue_size,
                "seed-queue-enabled": config.queue_enabled,
                "seed-queue-size": config.seed_queue_size,
                "blocklist-enabled": session.blocklist_len() > 0,
                "blocklist-size": session.blocklist_len(),
            }))
        }
        "session-set" => {
            session.update_config(|config| {
                if let Some(dir) = args.get("download-dir").and_then(Json::as_str) {
                    config.download_dir = PathBuf::from(dir);
                }
                if let Some(port) = args.get("peer-port").and_then(Json::as_u64) {
                    config.peer_port = port as u16;
                }
                if let Some(enabled) =
                    args.get("download-queue-enabled").and_then(Json::as_bool)
                {
                    config.queue_enabled = enabled;
                }
                if let Some(size) = args.get("download-queue-size").and_then(Json::as_u64) {
                    config.download_queue_size = size as usize;
                }
                if let Some(size) = args.get("seed-queue-size").and_then(Json::as_u64) {
                    config.seed_queue_size = size as usize;
                }
            });
            Ok(json!({}))
        }
        "session-stats" => {
            let stats = session.stats();
            Ok(json!({
                "torrentCount": stats.torrent_count,
                "activeTorrentCount": stats.active_torrent_count,
                "pausedTorrentCount": stats.paused_torrent_count,
                "uploadedBytes": stats.uploaded_bytes,
                "downloadedBytes": stats.downloaded_bytes,
                "secondsActive": stats.seconds_active,
            }))
        }
        "torrent-get" => {
            let fields: Option<Vec<&str>> = args.get("fields").and_then(Json::as_array).map(
                |items| items.iter().filter_map(Json::as_str).collect(),
            );
            let torrents: Vec<Json> = selected_ids(session, args)
                .into_iter()
                .filter_map(|id| torrent_json(session, id))
                .map(|mut full| {
                    if let (Some(fields), Some(map)) = (&fields, full.as_object_mut()) {
                        map.retain(|k, _| fields.contains(&k.as_str()));
                    }
                    full
                })
                .collect();
            Ok(json!({ "torrents": torrents }))
        }
        "torrent-add" => {
            let source = if let Some(b64) = args.get("metainfo").and_then(Json::as_str) {
                let bytes = cryptow::base64_decode(b64)
                    .ok_or_else(|| "invalid base64 in metainfo".to_owned())?;
                AddTorrent::TorrentBytes(bytes)
            } else if let Some(filename) = args.get("filename").and_then(Json::as_str) {
                if filename.starts_with("magnet:") {
                    AddTorrent::Magnet(filename.to_owned())
                } else {
                    AddTorrent::TorrentPath(PathBuf::from(filename))
                }
            } else {
                return Err("no metainfo or filename given".to_owned());
            };
            let options = AddTorrentOptions {
                paused: args.get("paused").and_then(Json::as_bool).unwrap_or(false),
                download_dir: args
                    .get("download-dir")
                    .and_then(Json::as_str)
                    .map(PathBuf::from),
                labels: args
                    .get("labels")
                    .and_then(Json::as_array)
                    .map(|l| {
                        l.iter()
                            .filter_map(Json::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            let id = session.add_torrent(source, options).map_err(|e| format!("{e:#}"))?;
            let added = torrent_json(session, id).unwrap_or(json!({}));
            Ok(json!({ "torrent-added": {
                "id": id,
                "name": added.get("name").cloned().unwrap_or_default(),
                "hashString": added.get("hashString").cloned().unwrap_or_default(),
            }}))
        }
        "torrent-start" | "torrent-start-now" => {
            for id in selected_ids(session, args) {
                session.start_torrent(id).map_err(|e| format!("{e:#}"))?;
            }
            Ok(json!({}))
        }
        "torrent-stop" => {
            for id in selected_ids(session, args) {
                session.stop_torrent(id).map_err(|e| format!("{e:#}"))?;
            }
            Ok(json!({}))
        }
        "torrent-verify" => {
            for id in selected_ids(session, args) {
                session.verify_torrent(id).map_err(|e| format!("{e:#}"))?;
            }
            Ok(json!({}))
        }
        "torrent-remove" => {
            let delete_data = args
                .get("delete-local-data")
                .and_then(Json::as_bool)
                .unwrap_or(false);
            for id in selected_ids(session, args) {
                session
                    .remove_torrent(id, delete_data)
                    .map_err(|e| format!("{e:#}"))?;
            }
            Ok(json!({}))
        }
        "torrent-set-location" => {
            let location = args
                .get("location")
                .and_then(Json::as_str)
                .ok_or_else(|| "location required".to_owned())?;
            let move_data = args.get("move").and_then(Json::as_bool).unwrap_or(false);
            for id in selected_ids(session, args) {
                session
                    .set_torrent_location(id, PathBuf::from(location), move_data)
                    .map_err(|e| format!("{e:#}"))?;
            }
            Ok(json!({}))
        }
        "queue-move-top" | "queue-move-up" | "queue-move-down" | "queue-move-bottom" => {
            for id in selected_ids(session, args) {
                let result = match method {
                    "queue-move-top" => session.queue_move_top(id),
                    "queue-move-up" => session.queue_move_up(id),
                    "queue-move-down" => session.queue_move_down(id),
                    _ => session.queue_move_bottom(id),
                };
                result.map_err(|e| format!("{e:#}"))?;
            }
            Ok(json!({}))
        }
        "blocklist-update" => {
            let path = args
                .get("path")
                .and_then(Json::as_str)
                .ok_or_else(|| "blocklist path required".to_owned())?;
            let text = std::fs::read_to_string(path).map_err(|e| format!("{e}"))?;
            let blocklist = Blocklist::parse_text(&text);
            let size = blocklist.len();
            session.set_blocklist(blocklist);
            Ok(json!({ "blocklist-size": size }))
        }
        other => Err(format!("method not recognized: {other:?}")),
    }
}

// --- static web UI ---

async fn handle_web_index(state: State<Arc<RpcServer>>) -> Response {
    serve_static(state, "index.html".to_owned()).await
}

async fn handle_web(state: State<Arc<RpcServer>>, UrlPath(path): UrlPath<String>) -> Response {
    serve_static(state, path).await
}

async fn serve_static(State(srv): State<Arc<RpcServer>>, path: String) -> Response {
    let Some(root) = &srv.config.web_ui_dir else {
        return plain(StatusCode::NOT_FOUND, "web ui not installed");
    };
    // traversal guard: any dot-dot anywhere is an immediate miss
    if path.split(['/', '\\']).any(|c| c == "..") {
        return plain(StatusCode::NOT_FOUND, "404 not found");
    }
    let full = root.join(&path);
    let body = match tokio::fs::read(&full).await {
        Ok(b) => b,
        Err(_) => return plain(StatusCode::NOT_FOUND, "404 not found"),
    };
    let mime = mime_guess::from_path(&full)
        .first_raw()
        .unwrap_or("application/octet-stream");

    let now = chrono::Utc::now();
    let http_date = |t: chrono::DateTime<chrono::Utc>| {
        t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    };
    Response::builder()
        .header(header::CONTENT_TYPE, mime)
        .header(header::DATE, http_date(now))
        .header(header::EXPIRES, http_date(now + chrono::Duration::hours(24)))
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
