//! Per-session and per-token grain proxies
//!
//! A [`Proxy`] owns the remote web session of one client binding. The
//! session is created lazily on the first request: the grain is started, its
//! view info fetched, the caller's permissions proven and then handed to the
//! app. A transport disconnect at any point of a request restarts the grain
//! and retries that request once.

use crate::http::{
    app_path, content_length, error_response, parse_accept, parse_cookies, translate_response,
    RequestMeta,
};
use axum::body::Body;
use axum::extract::{Query, Request};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use grainhost_backend::rpc::is_unimplemented_method;
use grainhost_backend::{
    keep_session_alive, GrainManager, RequestContent, RequestContext, RequestStream,
    SessionContext, SessionParams, UiView, UserInfo, WebResponse, WebSession,
};
use grainhost_core::{
    AccountId, ApiToken, Grain, GrainId, GrainhostError, HostId, Result, RpcErrorKind, Session,
    SessionId, TokenId, TokenWatch, ViewInfo,
};
use grainhost_permissions::{grain_permissions, Principal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

const SESSION_COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

/// What a proxy serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyBinding {
    /// A browser session on its own host
    Session {
        /// Session id, also the cookie value
        session_id: SessionId,
        /// Host label the session is served on
        host_id: HostId,
    },
    /// Bearer-token requests on the API host
    Api {
        /// Grant the requests present
        token_id: TokenId,
    },
}

#[derive(Default)]
struct Connection {
    ui_view: Option<Arc<dyn UiView>>,
    session: Option<Arc<dyn WebSession>>,
}

/// Forwards one client binding's traffic to a grain
pub struct Proxy {
    grain_id: GrainId,
    binding: ProxyBinding,
    principal: Principal,
    user: UserInfo,
    account_id: Option<AccountId>,
    expires: Option<DateTime<Utc>>,
    manager: Arc<GrainManager>,
    connection: tokio::sync::Mutex<Connection>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    sockets: Mutex<Vec<JoinHandle<()>>>,
    has_loaded: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("grain_id", &self.grain_id)
            .field("binding", &self.binding)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Proxy for an interactive session.
    ///
    /// Sessions opened through a webkey act as the webkey; all others act as
    /// the session's identity, or anonymously.
    pub fn for_session(manager: Arc<GrainManager>, session: &Session) -> Self {
        let principal = match &session.hashed_token {
            Some(token_id) => Principal::Token {
                token_id: token_id.clone(),
                grain_id: session.grain_id.clone(),
            },
            None => Principal::Identity {
                grain_id: session.grain_id.clone(),
                identity_id: session.identity_id.clone(),
            },
        };
        let user = match &session.identity_id {
            Some(identity_id) => UserInfo::identity(identity_id.clone()),
            None => UserInfo::anonymous(),
        };
        Self::new(
            manager,
            session.grain_id.clone(),
            ProxyBinding::Session {
                session_id: session.id.clone(),
                host_id: session.host_id.clone(),
            },
            principal,
            user,
            session.account_id.clone(),
            None,
        )
    }

    /// Proxy for bearer requests presenting `token`.
    ///
    /// Unless the grant was made for sharing, the app sees requests as coming
    /// from the identity that issued it.
    pub fn for_api_token(manager: Arc<GrainManager>, token: &ApiToken, account_id: Option<AccountId>) -> Self {
        let user = match (&token.identity_id, token.for_sharing) {
            (Some(identity_id), false) => UserInfo::identity(identity_id.clone()),
            _ => UserInfo::anonymous(),
        };
        Self::new(
            manager,
            token.grain_id.clone(),
            ProxyBinding::Api {
                token_id: token.id.clone(),
            },
            Principal::token(token),
            user,
            if token.for_sharing { None } else { account_id },
            token.expires,
        )
    }

    fn new(
        manager: Arc<GrainManager>,
        grain_id: GrainId,
        binding: ProxyBinding,
        principal: Principal,
        user: UserInfo,
        account_id: Option<AccountId>,
        expires: Option<DateTime<Utc>>,
    ) -> Self {
        tracing::debug!(grain_id = %grain_id, binding = ?binding, "proxy created");
        Self {
            grain_id,
            binding,
            principal,
            user,
            account_id,
            expires,
            manager,
            connection: tokio::sync::Mutex::new(Connection::default()),
            watcher: Mutex::new(None),
            sockets: Mutex::new(Vec::new()),
            has_loaded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Grain being proxied
    pub fn grain_id(&self) -> &GrainId {
        &self.grain_id
    }

    /// What this proxy serves
    pub fn binding(&self) -> &ProxyBinding {
        &self.binding
    }

    /// Whether this proxy serves the API host
    pub fn is_api(&self) -> bool {
        matches!(self.binding, ProxyBinding::Api { .. })
    }

    /// Whether [`Proxy::close`] ran
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the grant behind an API proxy has passed its `expires`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Drop the remote session and destroy open WebSockets.
    ///
    /// In-flight requests finish against the capabilities they already hold;
    /// new ones fail with `Gone`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        for socket in self.sockets.lock().drain(..) {
            socket.abort();
        }
        if let Ok(mut connection) = self.connection.try_lock() {
            *connection = Connection::default();
        }
        tracing::debug!(grain_id = %self.grain_id, binding = ?self.binding, "proxy closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(GrainhostError::gone("session was closed"));
        }
        Ok(())
    }

    /// Postpone the grain's idle shutdown, and the session's idle collection
    /// when bound to one
    pub async fn keep_alive(&self) -> Result<()> {
        self.ensure_open()?;
        match &self.binding {
            ProxyBinding::Session { session_id, .. } => {
                if !keep_session_alive(&self.manager, session_id).await? {
                    return Err(GrainhostError::gone("session has expired"));
                }
                Ok(())
            }
            ProxyBinding::Api { .. } => {
                self.manager
                    .use_grain(&self.grain_id, |supervisor| async move { supervisor.keep_alive().await })
                    .await
            }
        }
    }

    /// The remote session, creating it on first use
    pub async fn session(self: &Arc<Self>, meta: &RequestMeta) -> Result<Arc<dyn WebSession>> {
        self.ensure_open()?;
        let mut connection = self.connection.lock().await;
        if let Some(session) = &connection.session {
            return Ok(Arc::clone(session));
        }

        let ui_view = match &connection.ui_view {
            Some(ui_view) => Arc::clone(ui_view),
            None => {
                let grain = self.manager.open_grain(&self.grain_id, false).await?;
                let ui_view = grain.supervisor.main_view().await?;
                connection.ui_view = Some(Arc::clone(&ui_view));
                ui_view
            }
        };

        let view_info = self.view_info(ui_view.as_ref()).await?;
        let store = self.manager.store().as_ref();
        let granted = grain_permissions(
            store,
            &self.principal,
            &view_info,
            true,
            &self.manager.config().permissions,
        )?;
        let Some(permissions) = granted.permissions else {
            return Err(GrainhostError::permission_denied(
                "user is not authorized to open this grain",
            ));
        };
        if let ProxyBinding::Session { session_id, .. } = &self.binding {
            store.update_session(session_id, &mut |session: &mut Session| {
                session.view_info = Some(view_info.clone());
                session.permissions = Some(permissions.clone());
            })?;
        }
        if let Some(watch) = granted.watch {
            self.spawn_watcher(watch);
        }

        let user = self.user.clone().with_permissions(permissions);
        let session = self.new_session(ui_view.as_ref(), user, meta).await?;
        self.ensure_open()?;
        connection.session = Some(Arc::clone(&session));
        Ok(session)
    }

    /// View info from the app, cached on the grain; apps predating the call get none
    async fn view_info(&self, ui_view: &dyn UiView) -> Result<ViewInfo> {
        match ui_view.view_info().await {
            Ok(view_info) => {
                let cached = view_info.clone();
                self.manager
                    .store()
                    .update_grain(&self.grain_id, &mut |grain: &mut Grain| {
                        grain.cached_view_info = Some(cached.clone());
                    })?;
                Ok(view_info)
            }
            Err(GrainhostError::Rpc(rpc))
                if matches!(rpc.kind, RpcErrorKind::Failed | RpcErrorKind::Unimplemented) =>
            {
                tracing::debug!(grain_id = %self.grain_id, error = %rpc, "app has no view info");
                Ok(ViewInfo::default())
            }
            Err(err) => Err(err),
        }
    }

    async fn new_session(
        &self,
        ui_view: &dyn UiView,
        user: UserInfo,
        meta: &RequestMeta,
    ) -> Result<Arc<dyn WebSession>> {
        let context = SessionContext {
            grain_id: self.grain_id.clone(),
            session_id: match &self.binding {
                ProxyBinding::Session { session_id, .. } => Some(session_id.clone()),
                ProxyBinding::Api { .. } => None,
            },
            account_id: self.account_id.clone(),
        };
        if !self.is_api() {
            return ui_view.new_session(user, context, meta.web_params()).await;
        }

        let params = SessionParams::Api {
            remote_address: meta.remote_address,
        };
        match ui_view.new_session(user.clone(), context.clone(), params).await {
            Err(err) if !err.is_disconnected() => {
                tracing::debug!(grain_id = %self.grain_id, error = %err, "api session refused; using a web session");
                ui_view.new_session(user, context, meta.web_params()).await
            }
            other => other,
        }
    }

    fn spawn_watcher(self: &Arc<Self>, mut watch: TokenWatch) {
        if self.is_closed() {
            return;
        }
        let proxy: Weak<Proxy> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            watch.invalidated().await;
            if let Some(proxy) = proxy.upgrade() {
                tracing::debug!(grain_id = %proxy.grain_id, "grant behind proxy changed");
                proxy.close();
            }
        });
        if let Some(previous) = self.watcher.lock().replace(task) {
            previous.abort();
        }
        if self.is_closed() {
            if let Some(task) = self.watcher.lock().take() {
                task.abort();
            }
        }
    }

    /// Drop the connection and restart the grain
    async fn reconnect(&self) -> Result<()> {
        {
            let mut connection = self.connection.lock().await;
            *connection = Connection::default();
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.manager.continue_grain(&self.grain_id).await?;
        Ok(())
    }

    /// Run `call` on the session, reconnecting and retrying once if the grain
    /// disconnects
    pub async fn with_retry<T, F, Fut>(self: &Arc<Self>, meta: &RequestMeta, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn WebSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = async {
            let session = self.session(meta).await?;
            call(session).await
        }
        .await;

        match first {
            Err(err) if err.is_disconnected() => {
                tracing::warn!(grain_id = %self.grain_id, error = %err, "grain disconnected; reconnecting");
                self.reconnect().await?;
                let session = self.session(meta).await?;
                let retried = call(session).await;
                if let Err(err) = &retried {
                    tracing::error!(grain_id = %self.grain_id, error = %err, "request failed after reconnect");
                }
                retried
            }
            other => other,
        }
    }

    /// Track a WebSocket pump so closing the proxy destroys it
    pub(crate) fn register_socket(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        let mut sockets = self.sockets.lock();
        sockets.retain(|socket| !socket.is_finished());
        sockets.push(task);
    }

    /// Record that the client got its first response
    fn set_has_loaded(&self) {
        if self.has_loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        if let ProxyBinding::Session { session_id, .. } = &self.binding {
            let updated = self
                .manager
                .store()
                .update_session(session_id, &mut |session: &mut Session| session.has_loaded = true);
            if let Err(err) = updated {
                tracing::warn!(session_id = %session_id, error = %err, "failed to record session load");
            }
        }
    }

    /// Serve one HTTP request; errors become error responses
    pub async fn handle_request(self: &Arc<Self>, request: Request, peer: Option<SocketAddr>) -> Response {
        match self.dispatch(request, peer).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(grain_id = %self.grain_id, error = %err, "request failed");
                self.set_has_loaded();
                error_response(&err)
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, request: Request, peer: Option<SocketAddr>) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let meta = RequestMeta::new(&parts.headers, &parts.uri, peer);

        if let ProxyBinding::Session { session_id, .. } = &self.binding {
            if parts.uri.path() == self.manager.config().sessions.init_path {
                if let Some((id, path)) = session_init_params(&parts.uri) {
                    if id == session_id.as_str() {
                        return self.do_session_init(&path);
                    }
                }
            }
        }

        let context = self.make_context(&parts.headers)?;
        let path = app_path(&parts.uri);
        let response = match parts.method {
            Method::GET => {
                self.with_retry(&meta, |session| {
                    let context = context.clone();
                    let path = path.as_str();
                    async move { session.get(path, context).await }
                })
                .await?
            }
            Method::DELETE => {
                self.with_retry(&meta, |session| {
                    let context = context.clone();
                    let path = path.as_str();
                    async move { session.delete(path, context).await }
                })
                .await?
            }
            Method::POST | Method::PUT => {
                let threshold = self.manager.config().sessions.streaming_threshold_bytes;
                match content_length(&parts.headers) {
                    Some(length) if length <= threshold => {
                        let content = buffered_content(&parts.headers, body).await?;
                        self.forward_upload(&parts.method, &path, content, context, &meta).await?
                    }
                    length => {
                        self.forward_streaming(&parts.method, &path, &parts.headers, length, body, context, &meta)
                            .await?
                    }
                }
            }
            _ => {
                let err = GrainhostError::invalid(format!("method {} not supported", parts.method));
                let mut response = error_response(&err);
                *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                return Ok(response);
            }
        };
        self.translate(response)
    }

    fn translate(&self, response: WebResponse) -> Result<Response> {
        self.set_has_loaded();
        translate_response(response, !self.is_api())
    }

    /// Forwarded request context; session hosts require the session cookie
    pub(crate) fn make_context(&self, headers: &HeaderMap) -> Result<RequestContext> {
        let cookies = match &self.binding {
            ProxyBinding::Session { session_id, .. } => {
                let parsed = parse_cookies(headers, &self.manager.config().sessions.session_cookie)?;
                if parsed.session_id.as_deref() != Some(session_id.as_str()) {
                    return Err(GrainhostError::permission_denied(
                        "session ID cookie required; do you have cookies disabled?",
                    ));
                }
                parsed.cookies
            }
            ProxyBinding::Api { .. } => Vec::new(),
        };
        Ok(RequestContext {
            cookies,
            accept: parse_accept(headers),
        })
    }

    /// Bind the session cookie and send the client on to `path`
    fn do_session_init(&self, path: &str) -> Result<Response> {
        if !path.starts_with('/') || path.starts_with("//") {
            return Err(GrainhostError::invalid(format!("invalid path: {path}")));
        }
        let ProxyBinding::Session { session_id, .. } = &self.binding else {
            return Err(GrainhostError::invalid("session init on the API host"));
        };
        let cookie = format!(
            "{}={}; Max-Age={SESSION_COOKIE_MAX_AGE_SECS}; HttpOnly",
            self.manager.config().sessions.session_cookie,
            session_id
        );
        let header_value = |value: &str| {
            HeaderValue::from_str(value).map_err(|err| GrainhostError::invalid(format!("invalid header: {err}")))
        };
        Ok((
            StatusCode::SEE_OTHER,
            [
                (header::SET_COOKIE, header_value(&cookie)?),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache, private")),
                (header::LOCATION, header_value(path)?),
            ],
        )
            .into_response())
    }

    async fn forward_upload(
        self: &Arc<Self>,
        method: &Method,
        path: &str,
        content: RequestContent,
        context: RequestContext,
        meta: &RequestMeta,
    ) -> Result<WebResponse> {
        let is_put = *method == Method::PUT;
        self.with_retry(meta, |session| {
            let content = content.clone();
            let context = context.clone();
            async move {
                if is_put {
                    session.put(path, content, context).await
                } else {
                    session.post(path, content, context).await
                }
            }
        })
        .await
    }

    /// Stream the body to the app as it arrives.
    ///
    /// Only opening the stream is retried; once bytes are consumed the upload
    /// cannot be replayed. Apps without streaming support get the body
    /// buffered instead.
    #[allow(clippy::too_many_arguments)]
    async fn forward_streaming(
        self: &Arc<Self>,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        length: Option<u64>,
        body: Body,
        context: RequestContext,
        meta: &RequestMeta,
    ) -> Result<WebResponse> {
        let is_put = *method == Method::PUT;
        let (mime_type, encoding) = content_type(headers);
        let opened = self
            .with_retry(meta, |session| {
                let context = context.clone();
                let mime_type = mime_type.as_str();
                let encoding = encoding.as_deref();
                async move {
                    if is_put {
                        session.put_streaming(path, mime_type, encoding, context).await
                    } else {
                        session.post_streaming(path, mime_type, encoding, context).await
                    }
                }
            })
            .await;

        let stream = match opened {
            Ok(stream) => stream,
            Err(err) if is_unimplemented_method(&err) => {
                tracing::debug!(grain_id = %self.grain_id, "app lacks streaming uploads; buffering");
                let content = buffered_content(headers, body).await?;
                return self.forward_upload(method, path, content, context, meta).await;
            }
            Err(err) => return Err(err),
        };

        if let Some(length) = length {
            match stream.expect_size(length).await {
                Err(err) if !is_unimplemented_method(&err) => return Err(err),
                _ => {}
            }
        }

        let (_, response) = futures::try_join!(upload(stream.as_ref(), body), stream.get_response())?;
        Ok(response)
    }
}

async fn upload(stream: &dyn RequestStream, body: Body) -> Result<()> {
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|err| GrainhostError::invalid(format!("request body: {err}")))?;
        if !chunk.is_empty() {
            stream.write(chunk).await?;
        }
    }
    stream.done().await
}

fn content_type(headers: &HeaderMap) -> (String, Option<String>) {
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    (
        text(header::CONTENT_TYPE).unwrap_or_else(|| "application/octet-stream".to_string()),
        text(header::CONTENT_ENCODING),
    )
}

async fn buffered_content(headers: &HeaderMap, body: Body) -> Result<RequestContent> {
    let content: Bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|err| GrainhostError::invalid(format!("request body: {err}")))?;
    let (mime_type, encoding) = content_type(headers);
    Ok(RequestContent {
        mime_type,
        encoding,
        content,
    })
}

/// `sessionid` and `path` of a session init request
fn session_init_params(uri: &Uri) -> Option<(String, String)> {
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    let session_id = params.remove("sessionid")?;
    let path = params.remove("path")?;
    Some((session_id, path))
}
