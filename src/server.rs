//! Request dispatcher.
//!
//! A single catch-all handler resolves every inbound request against the
//! observer, picks a response, authenticates, produces the body (template,
//! file, or upstream proxy), resolves status/headers against `_default`,
//! applies the capped delay, writes the transaction log, and answers.
//! Dispatch failures answer 599 with an `X-Mockka-Error` header and no body.

use crate::config::Config;
use crate::metrics;
use crate::observer::Observer;
use crate::rule::{Auth, DEFAULT_RESPONSE, Response, Rule};
use crate::stabber::{self, RequestContext};
use crate::txlog::{Record, TxLog};
use anyhow::Context;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response as HttpResponse;
use base64::Engine;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Status code reserved for internal dispatch errors. A real upstream 599 is
/// still proxied verbatim.
const ERROR_HTTP_CODE: u16 = 599;

pub const ERR_NO_RULE: &str = "RuleNotFound";
pub const ERR_NO_RESPONSE: &str = "ResponseNotFound";
pub const ERR_CANT_RENDER: &str = "CantRenderTemplate";
pub const ERR_CANT_PROXY: &str = "CantProxyRequest";
pub const ERR_FORBIDDEN: &str = "ForbidenAction";

/// Shared dispatcher state.
pub struct ServerState {
    pub observer: Arc<Observer>,
    pub client: reqwest::Client,
    pub server_token: String,
    pub allow_proxying: bool,
    pub max_delay: f64,
    pub tx_log: TxLog,
}

/// Build dispatcher state from config. The proxy client reuses the HTTP write
/// timeout as its total timeout.
pub fn build_state(config: &Config, observer: Arc<Observer>) -> anyhow::Result<ServerState> {
    let write_timeout = config.http.write_timeout;
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(std::cmp::min(10, write_timeout)))
        .timeout(Duration::from_secs(write_timeout))
        .build()
        .context("build proxy client")?;

    let tx_log = TxLog::new(
        &config.data.log_dir,
        config.log_type(),
        config.access.user.clone(),
        config.access.group.clone(),
        config.log_perms(),
        config.log_dir_perms(),
    );

    Ok(ServerState {
        observer,
        client,
        server_token: format!("mockka/{}", env!("CARGO_PKG_VERSION")),
        allow_proxying: config.processing.allow_proxying,
        max_delay: config.http.max_delay,
        tx_log,
    })
}

/// Router with the catch-all dispatch handler.
pub fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> HttpResponse {
    let started = Instant::now();
    let (parts, body) = req.into_parts();

    let method = parts.method.as_str().to_string();
    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let host = host_without_port(&parts.headers);
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    debug!(%method, %host, uri = %request_uri, "request");

    let Some(rule) = state.observer.get_rule(&host, &method, &request_uri).await else {
        error!("can't find rule for request {method} -> {host}{request_uri}");
        return error_response(&state, ERR_NO_RULE);
    };

    let mut resp = match select_response(&rule) {
        Some((_, resp)) => resp.clone(),
        None => {
            error!("can't find response for request {method} -> {host}{request_uri}");
            return error_response(&state, ERR_NO_RESPONSE);
        }
    };

    // Body production. HEAD answers with headers only.
    let mut response_content = String::new();
    if method != "HEAD" {
        if resp.url.is_empty() {
            let ctx = request_context(&parts.uri, &parts.headers);
            match stabber::render(&resp.body(), &ctx) {
                Ok(rendered) => response_content = rendered,
                Err(e) => {
                    error!("can't render response body: {e}");
                    return error_response(&state, ERR_CANT_RENDER);
                }
            }
        } else {
            if !state.allow_proxying {
                error!("can't proxy request: proxying disabled in configuration file");
                return error_response(&state, ERR_FORBIDDEN);
            }
            match proxy_request(&state.client, &rule, &resp, &parts.headers, &body_bytes).await {
                Ok(upstream) => {
                    response_content = upstream.body;
                    if resp.overwrite {
                        resp.code = upstream.code;
                        resp.headers = upstream.headers;
                    }
                }
                Err(e) => {
                    error!("can't proxy request: {e}");
                    return error_response(&state, ERR_CANT_PROXY);
                }
            }
        }
    }

    // Failed auth terminates without a transaction log entry.
    if rule.auth.is_required() && !basic_auth_ok(&parts.headers, &rule.auth) {
        return plain_response(&state, StatusCode::UNAUTHORIZED, BTreeMap::new(), String::new());
    }

    let code = resolve_code(&rule, &resp);
    let headers = resolve_headers(&rule, &resp);

    if resp.delay > 0.0 {
        let secs = resp.delay.min(state.max_delay);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    // Log before the client sees the response, so records are complete even
    // when the client disconnects.
    let record = build_record(
        &rule, &resp, &parts.headers, &parts.uri, &method, &request_uri, peer, code, &headers,
        &body_bytes, &response_content,
    );
    if let Err(e) = state
        .tx_log
        .write(&rule.service, &rule.dir, &rule.name, &record)
    {
        error!("can't write transaction log: {e}");
    }

    metrics::record_request(&rule.service, code, started.elapsed().as_secs_f64());

    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
    let body = if method == "HEAD" {
        String::new()
    } else {
        response_content
    };
    plain_response(&state, status, headers, body)
}

/// Pick the response for a rule: the lone response when there is exactly one,
/// otherwise a uniform-random choice over the non-`_default` ids.
fn select_response(rule: &Rule) -> Option<(&str, &Response)> {
    match rule.responses.len() {
        0 => None,
        1 => rule
            .responses
            .iter()
            .next()
            .map(|(id, resp)| (id.as_str(), resp)),
        _ => {
            let ids = rule.selectable_ids();
            let id = ids[rand::random_range(0..ids.len())];
            rule.responses.get(id).map(|resp| (id, resp))
        }
    }
}

/// Effective status code: the response's, else `_default`'s, else 200.
fn resolve_code(rule: &Rule, resp: &Response) -> u16 {
    if resp.code != 0 {
        return resp.code;
    }
    match rule.responses.get(DEFAULT_RESPONSE) {
        Some(default) if default.code != 0 => default.code,
        _ => 200,
    }
}

/// Effective headers: the response's when non-empty, else `_default`'s.
fn resolve_headers(rule: &Rule, resp: &Response) -> BTreeMap<String, String> {
    if !resp.headers.is_empty() {
        return resp.headers.clone();
    }
    match rule.responses.get(DEFAULT_RESPONSE) {
        Some(default) if !default.headers.is_empty() => default.headers.clone(),
        _ => BTreeMap::new(),
    }
}

/// Host header value without the port part.
fn host_without_port(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    host.split(':').next().unwrap_or("").to_string()
}

/// Check HTTP Basic credentials against the rule's auth.
fn basic_auth_ok(headers: &HeaderMap, auth: &Auth) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, password)) => user == auth.user && password == auth.password,
        None => false,
    }
}

struct UpstreamResponse {
    body: String,
    code: u16,
    headers: BTreeMap<String, String>,
}

/// Issue the upstream request with the rule's method, forwarding inbound
/// headers (space-joined) and the request body when present. Host and
/// Content-Length are left to the client to compute.
async fn proxy_request(
    client: &reqwest::Client,
    rule: &Rule,
    resp: &Response,
    headers: &HeaderMap,
    body: &[u8],
) -> anyhow::Result<UpstreamResponse> {
    let method = reqwest::Method::from_bytes(rule.request.method.as_bytes())
        .context("proxy request method")?;

    let mut request = client.request(method, &resp.url);
    for name in unique_header_names(headers) {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        request = request.header(name.as_str(), join_header_values(headers, &name));
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let upstream = request.send().await.context("proxy request")?;
    let code = upstream.status().as_u16();
    let mut upstream_headers = BTreeMap::new();
    for name in unique_header_names(upstream.headers()) {
        // The upstream body arrives fully decoded; framing headers would lie.
        if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
            continue;
        }
        upstream_headers.insert(
            name.as_str().to_string(),
            join_header_values(upstream.headers(), &name),
        );
    }
    let body = upstream.text().await.context("read proxied body")?;

    Ok(UpstreamResponse {
        body,
        code,
        headers: upstream_headers,
    })
}

fn unique_header_names(headers: &HeaderMap) -> Vec<HeaderName> {
    let mut names: Vec<HeaderName> = Vec::new();
    for name in headers.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

fn join_header_values(headers: &HeaderMap, name: &HeaderName) -> String {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Template context: raw query pairs in request order plus headers.
fn request_context(uri: &axum::http::Uri, headers: &HeaderMap) -> RequestContext {
    RequestContext {
        query: query_pairs(uri.query()),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    }
}

/// Split a raw query string into pairs, preserving order and multiplicity.
fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Sorted (name, space-joined values) pairs for the transaction log.
fn sorted_multi_pairs(pairs: &[(String, String)]) -> Vec<(String, String)> {
    let mut grouped: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in pairs {
        grouped.entry(name.clone()).or_default().push(value);
    }
    grouped
        .into_iter()
        .map(|(name, values)| (name, values.join(" ")))
        .collect()
}

/// Cookie strings from the Cookie header(s), sorted.
fn parse_cookies(headers: &HeaderMap) -> Vec<String> {
    let mut cookies: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect();
    cookies.sort();
    cookies
}

/// Remote address for the log: X-Real-Ip, first of X-Forwarded-For, else the
/// socket peer.
fn remote_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.to_string()
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    rule: &Rule,
    resp: &Response,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    method: &str,
    request_uri: &str,
    peer: SocketAddr,
    code: u16,
    effective_headers: &BTreeMap<String, String>,
    body_bytes: &[u8],
    response_content: &str,
) -> Record {
    let request_headers: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let query = if method == "GET" {
        sorted_multi_pairs(&query_pairs(uri.query()))
    } else {
        Vec::new()
    };

    Record {
        date: chrono::Local::now(),
        mock: rule.path.display().to_string(),
        remote_address: remote_address(headers, peer),
        request_host: rule.request.host.clone(),
        method: method.to_string(),
        request_uri: request_uri.to_string(),
        response_url: resp.url.clone(),
        status_code: code,
        status_desc: StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string(),
        request_headers: sorted_multi_pairs(&request_headers),
        cookies: parse_cookies(headers),
        query,
        request_body: String::from_utf8_lossy(body_bytes).into_owned(),
        response_body: response_content.to_string(),
        response_headers: effective_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// 599 answer with the error kind header and no body.
fn error_response(state: &ServerState, kind: &str) -> HttpResponse {
    metrics::record_dispatch_error(kind);
    let mut response = HttpResponse::new(Body::empty());
    *response.status_mut() = StatusCode::from_u16(ERROR_HTTP_CODE).unwrap_or(StatusCode::OK);
    set_header(&mut response, header::SERVER.as_str(), &state.server_token);
    set_header(&mut response, "X-Mockka-Error", kind);
    response
}

fn plain_response(
    state: &ServerState,
    status: StatusCode,
    headers: BTreeMap<String, String>,
    body: String,
) -> HttpResponse {
    let mut response = HttpResponse::new(Body::from(body));
    *response.status_mut() = status;
    set_header(&mut response, header::SERVER.as_str(), &state.server_token);
    for (name, value) in &headers {
        set_header(&mut response, name, value);
    }
    response
}

fn set_header(response: &mut HttpResponse, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        response.headers_mut().insert(name, value);
    }
}
