//! HTTP translation between clients and grain sessions
//!
//! Parsing of the request headers the kernel interprets itself (cookies,
//! `Accept`, credentials, address passthrough) and conversion of app
//! responses into HTTP responses.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use grainhost_backend::{
    AcceptedType, ResponseBody, ResponsePayload, SessionParams, SuccessCode, WebResponse,
};
use grainhost_core::{GrainhostError, Result};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Header carrying a webkey keep-alive duration in seconds
pub const KEEPALIVE_HEADER: &str = "x-grainhost-token-keepalive";

/// Header listing what the client opts into passing through to the app
pub const PASSTHROUGH_HEADER: &str = "x-grainhost-passthrough";

/// Policy that neuters API responses loaded in a browser context
pub const API_CONTENT_SECURITY_POLICY: &str = "default-src 'none'; sandbox";

/// Cookies of a session-host request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCookies {
    /// Value of the session cookie
    pub session_id: Option<String>,
    /// Every other cookie, forwarded to the app
    pub cookies: Vec<(String, String)>,
}

/// Split the `Cookie` headers, separating out the session cookie
pub fn parse_cookies(headers: &HeaderMap, session_cookie: &str) -> Result<ParsedCookies> {
    let mut parsed = ParsedCookies::default();
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if pair.trim().is_empty() {
                continue;
            }
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (pair.trim(), ""),
            };
            if key == session_cookie {
                if parsed.session_id.is_some() {
                    return Err(GrainhostError::invalid("multiple session cookies"));
                }
                parsed.session_id = Some(value.to_string());
            } else {
                parsed.cookies.push((key.to_string(), value.to_string()));
            }
        }
    }
    Ok(parsed)
}

/// Entries of the `Accept` header in order
pub fn parse_accept(headers: &HeaderMap) -> Vec<AcceptedType> {
    let Some(value) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let mut parts = entry.split(';');
            let mime_type = parts.next().unwrap_or_default().trim().to_string();
            let q_value = parts.find_map(|param| {
                let (key, value) = param.split_once('=')?;
                (key.trim() == "q").then(|| value.trim().parse::<f32>().ok()).flatten()
            });
            AcceptedType { mime_type, q_value }
        })
        .collect()
}

/// Clients that can only send credentials as a Basic-auth password
pub fn uses_basic_auth(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|agent| agent.starts_with("git/") || agent.starts_with("GitHub-Hookshot/"))
}

/// Bearer secret of an API request
pub fn api_token_for_request(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    if auth.get(..7).is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer ")) {
        return Some(auth[7..].trim().to_string());
    }
    if auth.get(..6).is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic ")) && uses_basic_auth(headers) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth[6..].trim())
            .ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        return credentials.split(':').nth(1).map(str::to_string);
    }
    None
}

/// Whether an address is loopback or on a private network
pub fn is_private_or_local(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xff00) == 0xfd00,
    }
}

/// Client address to hand an API session, when the client opted in.
///
/// `X-Real-IP` is honoured only from proxies on loopback or private
/// networks. IPv4 addresses are mapped into IPv6.
pub fn remote_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<Ipv6Addr> {
    let opted_in = headers
        .get(PASSTHROUGH_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| value.split(',').any(|item| item.trim() == "address"));
    if !opted_in {
        return None;
    }

    let mut address = peer?.ip();
    if is_private_or_local(address) {
        if let Some(real) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            address = real;
        }
    }
    Some(match address {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    })
}

/// The parts of a request a new session is created from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    /// Origin the request was addressed to
    pub base_path: String,
    /// `User-Agent`
    pub user_agent: String,
    /// `Accept-Language` entries
    pub accept_languages: Vec<String>,
    /// Opted-in client address
    pub remote_address: Option<Ipv6Addr>,
}

impl RequestMeta {
    /// Collect from request headers
    pub fn new(headers: &HeaderMap, uri: &Uri, peer: Option<SocketAddr>) -> Self {
        let text = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok());
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        let host = host_of(headers, uri).unwrap_or_default();
        Self {
            base_path: format!("{scheme}://{host}"),
            user_agent: text(header::USER_AGENT).unwrap_or("UnknownAgent/0.0").to_string(),
            accept_languages: match text(header::ACCEPT_LANGUAGE) {
                Some(value) => value.split(',').map(|s| s.trim().to_string()).collect(),
                None => vec!["en-US".to_string(), "en".to_string()],
            },
            remote_address: remote_address(headers, peer),
        }
    }

    /// Parameters of a browser-facing session
    pub fn web_params(&self) -> SessionParams {
        SessionParams::Web {
            base_path: self.base_path.clone(),
            user_agent: self.user_agent.clone(),
            accept_languages: self.accept_languages.clone(),
        }
    }
}

/// `Host` of a request, including any port
pub fn host_of<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
}

/// First label of the request host
pub fn host_label<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    let host = host_of(headers, uri)?;
    let host = host.split(':').next().unwrap_or(host);
    host.split('.').next().filter(|label| !label.is_empty())
}

/// Path and query as the app sees them, without the leading slash
pub fn app_path(uri: &Uri) -> String {
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    path.strip_prefix('/').unwrap_or(path).to_string()
}

/// `Content-Length` of a request, when given and valid
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `Content-Disposition` value offering a download
pub fn download_disposition(file_name: &str) -> String {
    let mut escaped = String::with_capacity(file_name.len());
    for c in file_name.chars() {
        if matches!(c, '\\' | '"' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    format!("attachment; filename=\"{escaped}\"")
}

/// Status of a redirect response
pub fn redirect_status(is_permanent: bool, switch_to_get: bool) -> StatusCode {
    match (switch_to_get, is_permanent) {
        (false, false) => StatusCode::TEMPORARY_REDIRECT,
        (false, true) => StatusCode::PERMANENT_REDIRECT,
        (true, false) => StatusCode::SEE_OTHER,
        (true, true) => StatusCode::MOVED_PERMANENTLY,
    }
}

fn status(code: u16) -> Result<StatusCode> {
    StatusCode::from_u16(code).map_err(|err| GrainhostError::internal(format!("bad status {code}: {err}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| GrainhostError::internal(format!("bad header value from app: {err}")))
}

fn default_error_page(code: StatusCode) -> String {
    format!(
        "<html><body><h1>{}: {}</h1></body></html>",
        code.as_u16(),
        code.canonical_reason().unwrap_or_default()
    )
}

/// Convert an app response.
///
/// App cookies are only honoured on session hosts; API responses instead get
/// headers that keep bearer-authorized content out of shared caches and
/// browser contexts.
pub fn translate_response(response: WebResponse, session_host: bool) -> Result<Response> {
    let mut builder = Response::builder();
    if session_host {
        for cookie in &response.set_cookies {
            builder = builder.header(header::SET_COOKIE, header_value(&cookie.header_value())?);
        }
    } else {
        builder = builder
            .header(header::VARY, "Authorization")
            .header(header::CONTENT_SECURITY_POLICY, API_CONTENT_SECURITY_POLICY);
    }

    let built = match response.payload {
        ResponsePayload::Content {
            status: code,
            mime_type,
            encoding,
            language,
            download,
            body,
        } => {
            builder = builder.status(status(SuccessCode::status(code))?);
            if let Some(mime_type) = mime_type {
                builder = builder.header(header::CONTENT_TYPE, header_value(&mime_type)?);
            }
            if let Some(encoding) = encoding {
                builder = builder.header(header::CONTENT_ENCODING, header_value(&encoding)?);
            }
            if let Some(language) = language {
                builder = builder.header(header::CONTENT_LANGUAGE, header_value(&language)?);
            }
            if let Some(download) = download {
                builder = builder.header(header::CONTENT_DISPOSITION, header_value(&download_disposition(&download))?);
            }
            match body {
                ResponseBody::Bytes(bytes) => builder.body(Body::from(bytes)),
                ResponseBody::Stream(stream) => builder.body(Body::from_stream(stream)),
            }
        }
        ResponsePayload::NoContent { should_reset_form } => {
            let code = if should_reset_form {
                StatusCode::RESET_CONTENT
            } else {
                StatusCode::NO_CONTENT
            };
            builder.status(code).body(Body::empty())
        }
        ResponsePayload::Redirect {
            is_permanent,
            switch_to_get,
            location,
        } => builder
            .status(redirect_status(is_permanent, switch_to_get))
            .header(header::LOCATION, header_value(&location)?)
            .body(Body::empty()),
        ResponsePayload::ClientError {
            status: code,
            description_html,
        } => {
            let code = status(code.status().0)?;
            builder
                .status(code)
                .header(header::CONTENT_TYPE, "text/html")
                .body(Body::from(description_html.unwrap_or_else(|| default_error_page(code))))
        }
        ResponsePayload::ServerError { description_html } => builder
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(header::CONTENT_TYPE, "text/html")
            .body(Body::from(
                description_html.unwrap_or_else(|| default_error_page(StatusCode::INTERNAL_SERVER_ERROR)),
            )),
    };
    built.map_err(|err| GrainhostError::internal(format!("failed to build response: {err}")))
}

/// Plain-text response
pub fn plain_response(code: StatusCode, body: impl Into<String>) -> Response {
    (code, [(header::CONTENT_TYPE, "text/plain")], body.into()).into_response()
}

/// Response reporting a kernel error
pub fn error_response(err: &GrainhostError) -> Response {
    let code = StatusCode::from_u16(err.http_status().0).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    plain_response(code, err.to_string())
}
