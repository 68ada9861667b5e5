//! Axum front end for the session hosts and the API host

use crate::http::{
    api_token_for_request, error_response, host_label, plain_response, uses_basic_auth, KEEPALIVE_HEADER,
};
use crate::proxy::Proxy;
use crate::registry::ProxyRegistry;
use crate::websocket::{is_upgrade_request, upgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use grainhost_core::{GrainhostError, HostId, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::cors::{AllowHeaders, AllowMethods, Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct Hosts {
    registry: Arc<ProxyRegistry>,
    api: Router,
}

/// Router dispatching every request by its `Host`
pub fn router(registry: Arc<ProxyRegistry>) -> Router {
    let api = Router::new()
        .fallback(handle_api)
        .layer(api_cors())
        .with_state(Arc::clone(&registry));
    Router::new()
        .fallback(dispatch)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(Hosts { registry, api })
}

/// Bearer tokens rather than cookies authorize API requests, so any origin
/// may call the API host; preflights echo the requested method and headers.
fn api_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .max_age(Duration::from_secs(3600))
}

/// Serve `registry` on `listener` until the server fails
pub async fn serve(listener: TcpListener, registry: Arc<ProxyRegistry>) -> Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(address = %local, "serving grain proxies");
    let app = router(registry).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}

fn peer_of(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(address)| *address)
}

async fn dispatch(State(hosts): State<Hosts>, request: Request) -> Response {
    let Some(label) = host_label(request.headers(), request.uri()).map(str::to_string) else {
        return plain_response(StatusCode::BAD_REQUEST, "missing Host header");
    };

    if label == hosts.registry.manager().config().sessions.api_host_id {
        match hosts.api.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    } else {
        let peer = peer_of(&request);
        handle_session_host(&hosts.registry, HostId::new(label), request, peer).await
    }
}

async fn handle_session_host(
    registry: &ProxyRegistry,
    host_id: HostId,
    request: Request,
    peer: Option<SocketAddr>,
) -> Response {
    let proxy = match registry.proxy_for_host(&host_id) {
        Ok(Some(proxy)) => proxy,
        Ok(None) => return plain_response(StatusCode::NOT_FOUND, "no such session"),
        Err(err) => return error_response(&err),
    };

    if is_upgrade_request(request.headers()) {
        if !same_origin(request.headers()) {
            return plain_response(
                StatusCode::FORBIDDEN,
                "detected illegal cross-origin WebSocket from a session host",
            );
        }
        return websocket(&proxy, request, peer).await;
    }
    proxy.handle_request(request, peer).await
}

async fn handle_api(State(registry): State<Arc<ProxyRegistry>>, request: Request) -> Response {
    let peer = peer_of(&request);
    let Some(secret) = api_token_for_request(request.headers()) else {
        return missing_token(request.headers());
    };

    if let Some(keepalive) = request.headers().get(KEEPALIVE_HEADER) {
        let refreshed = keepalive
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| GrainhostError::invalid("keep-alive must be a whole number of seconds"))
            .and_then(|secs| registry.refresh_webkey(&secret, Duration::from_secs(secs)));
        return match refreshed {
            Ok(()) => StatusCode::OK.into_response(),
            Err(err) => error_response(&err),
        };
    }

    let proxy = match registry.proxy_for_api_token(&secret) {
        Ok(proxy) => proxy,
        Err(err) => return error_response(&err),
    };
    if is_upgrade_request(request.headers()) {
        return websocket(&proxy, request, peer).await;
    }
    proxy.handle_request(request, peer).await
}

async fn websocket(proxy: &Arc<Proxy>, request: Request, peer: Option<SocketAddr>) -> Response {
    match upgrade(proxy, request, peer).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(grain_id = %proxy.grain_id(), error = %err, "websocket setup failed");
            error_response(&err)
        }
    }
}

fn missing_token(headers: &HeaderMap) -> Response {
    if uses_basic_auth(headers) {
        let mut response = plain_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"Grainhost API\""),
        );
        return response;
    }
    plain_response(
        StatusCode::FORBIDDEN,
        "Missing or invalid authorization header.\n\n\
         This address serves APIs, which allow external apps to interact with apps running \
         on this server. An API request must carry an \"Authorization: Bearer <token>\" header.",
    )
}

/// Whether a WebSocket's `Origin` names the host it connects to
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let origin_host = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|host| host.eq_ignore_ascii_case(origin_host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("abc.grains.example:6080"));
        assert!(!same_origin(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://abc.grains.example:6080"));
        assert!(same_origin(&headers));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://evil.example"));
        assert!(!same_origin(&headers));
    }
}
