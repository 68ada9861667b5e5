//! In-process grain backend
//!
//! Every capability handed out by a [`MockBackend`] shares one [`MockApp`],
//! which records the calls it sees and decides how they fail.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use grainhost_backend::{
    Backend, ByteStream, ClientErrorCode, RequestContent, RequestContext, RequestStream,
    ResponseBody, ResponsePayload, SessionContext, SessionParams, SetCookie, StartGrainParams,
    SuccessCode, Supervisor, UiView, UserInfo, WebResponse, WebSession, WebSocketSession,
};
use grainhost_core::{AccountId, GrainId, Result, RpcError, ViewInfo};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A request as the app received it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// `GET`, `POST`, `POST-STREAM`, `WS`, ...
    pub method: String,
    /// Path without the leading slash handling of the proxy
    pub path: String,
    /// Cookies and accept list
    pub context: RequestContext,
    /// Buffered body, when there was one
    pub body: Option<Bytes>,
}

/// A `newSession` call as the app received it
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionCall {
    /// User the session is for
    pub user: UserInfo,
    /// Session context
    pub context: SessionContext,
    /// Session type
    pub params: SessionParams,
}

struct AppState {
    view_info: ViewInfo,
    fail_next_calls: usize,
    streaming_unimplemented: bool,
    view_info_unimplemented: bool,
    api_sessions_unsupported: bool,
    requests: Vec<RecordedRequest>,
    sessions: Vec<NewSessionCall>,
    keep_alives: usize,
}

/// Shared behaviour of a fake app
#[derive(Clone)]
pub struct MockApp {
    state: Arc<Mutex<AppState>>,
}

impl Default for MockApp {
    fn default() -> Self {
        Self::new(crate::notes_view_info())
    }
}

impl MockApp {
    /// An app declaring `view_info`
    pub fn new(view_info: ViewInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(AppState {
                view_info,
                fail_next_calls: 0,
                streaming_unimplemented: false,
                view_info_unimplemented: false,
                api_sessions_unsupported: false,
                requests: Vec::new(),
                sessions: Vec::new(),
                keep_alives: 0,
            })),
        }
    }

    /// The next `n` session requests and keep-alives fail as if the grain died
    pub fn fail_next_calls(&self, n: usize) {
        self.state.lock().fail_next_calls = n;
    }

    /// Behave like an app predating streaming uploads
    pub fn set_streaming_unimplemented(&self, value: bool) {
        self.state.lock().streaming_unimplemented = value;
    }

    /// Behave like an app predating `getViewInfo`
    pub fn set_view_info_unimplemented(&self, value: bool) {
        self.state.lock().view_info_unimplemented = value;
    }

    /// Behave like an app that only knows web sessions
    pub fn set_api_sessions_unsupported(&self, value: bool) {
        self.state.lock().api_sessions_unsupported = value;
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Sessions created so far
    pub fn sessions(&self) -> Vec<NewSessionCall> {
        self.state.lock().sessions.clone()
    }

    /// Keep-alives that reached the app
    pub fn keep_alives(&self) -> usize {
        self.state.lock().keep_alives
    }

    fn check_connected(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next_calls > 0 {
            state.fail_next_calls -= 1;
            return Err(RpcError::disconnected("grain process exited").into());
        }
        Ok(())
    }

    fn record(&self, method: &str, path: &str, context: RequestContext, body: Option<Bytes>) {
        self.state.lock().requests.push(RecordedRequest {
            method: method.to_string(),
            path: path.to_string(),
            context,
            body,
        });
    }
}

/// Fake backend handing out [`MockSupervisor`]s
pub struct MockBackend {
    app: MockApp,
    starts: AtomicUsize,
    failing_starts: AtomicUsize,
    start_delay_ms: AtomicU64,
    shutdowns: Arc<AtomicUsize>,
    storage_usage: Mutex<Option<u64>>,
    started: Mutex<Vec<StartGrainParams>>,
    deleted: Mutex<Vec<GrainId>>,
}

impl MockBackend {
    /// A backend running `app` for every grain
    pub fn new(app: MockApp) -> Self {
        Self {
            app,
            starts: AtomicUsize::new(0),
            failing_starts: AtomicUsize::new(0),
            start_delay_ms: AtomicU64::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            storage_usage: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// The shared app
    pub fn app(&self) -> &MockApp {
        &self.app
    }

    /// Delay each start so concurrent openers overlap
    pub fn set_start_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.start_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// The next `n` starts fail
    pub fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    /// Report this storage usage; unimplemented until set
    pub fn set_storage_usage(&self, bytes: u64) {
        *self.storage_usage.lock() = Some(bytes);
    }

    /// Start attempts so far
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Parameters of successful starts
    pub fn started(&self) -> Vec<StartGrainParams> {
        self.started.lock().clone()
    }

    /// Shutdowns requested through supervisors
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Grains whose storage was deleted
    pub fn deleted(&self) -> Vec<GrainId> {
        self.deleted.lock().clone()
    }

    fn supervisor(&self) -> Arc<dyn Supervisor> {
        Arc::new(MockSupervisor {
            app: self.app.clone(),
            shutdowns: Arc::clone(&self.shutdowns),
        })
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn start_grain(&self, params: StartGrainParams) -> Result<Arc<dyn Supervisor>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RpcError::failed("sandbox failed to start").into());
        }
        tracing::debug!(grain_id = %params.grain_id, "mock grain started");
        self.started.lock().push(params);
        Ok(self.supervisor())
    }

    async fn get_grain(&self, _owner: &AccountId, _grain_id: &GrainId) -> Result<Arc<dyn Supervisor>> {
        Ok(self.supervisor())
    }

    async fn delete_grain(&self, _owner: &AccountId, grain_id: &GrainId) -> Result<()> {
        self.deleted.lock().push(grain_id.clone());
        Ok(())
    }

    async fn user_storage_usage(&self, _account: &AccountId) -> Result<u64> {
        let usage = *self.storage_usage.lock();
        usage.ok_or_else(|| RpcError::unimplemented("getUserStorageUsage").into())
    }
}

/// Supervisor of a mock grain
pub struct MockSupervisor {
    app: MockApp,
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Supervisor for MockSupervisor {
    async fn main_view(&self) -> Result<Arc<dyn UiView>> {
        Ok(Arc::new(MockUiView {
            app: self.app.clone(),
        }))
    }

    async fn keep_alive(&self) -> Result<()> {
        self.app.check_connected()?;
        self.app.state.lock().keep_alives += 1;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Err(RpcError::disconnected("grain shut down").into())
    }
}

/// Main view of a mock grain
pub struct MockUiView {
    app: MockApp,
}

#[async_trait]
impl UiView for MockUiView {
    async fn view_info(&self) -> Result<ViewInfo> {
        let state = self.app.state.lock();
        if state.view_info_unimplemented {
            return Err(RpcError::unimplemented("getViewInfo").into());
        }
        Ok(state.view_info.clone())
    }

    async fn new_session(
        &self,
        user: UserInfo,
        context: SessionContext,
        params: SessionParams,
    ) -> Result<Arc<dyn WebSession>> {
        let mut state = self.app.state.lock();
        if params.is_api() && state.api_sessions_unsupported {
            return Err(RpcError::unimplemented("newSession(ApiSession)").into());
        }
        state.sessions.push(NewSessionCall {
            user: user.clone(),
            context,
            params,
        });
        Ok(Arc::new(MockWebSession {
            app: self.app.clone(),
            user,
        }))
    }
}

/// Session that answers every request with a description of it.
///
/// A few paths behave specially:
///
/// - `/whoami`: `identity|permission bits`, e.g. `alice|10`
/// - `/redirect`: 303 to `/elsewhere`
/// - `/missing`: 404
/// - `/stream`: a body streamed in two chunks
/// - `/cookie`: sets `flavor=oatmeal`
pub struct MockWebSession {
    app: MockApp,
    user: UserInfo,
}

impl MockWebSession {
    fn respond(&self, method: &str, path: &str, body: Option<&Bytes>) -> WebResponse {
        match path {
            "whoami" | "/whoami" => {
                let identity = self
                    .user
                    .identity_id
                    .as_ref()
                    .map_or("anonymous", |id| id.as_str())
                    .to_string();
                let bits: String = self
                    .user
                    .permissions
                    .as_slice()
                    .iter()
                    .map(|bit| if *bit { '1' } else { '0' })
                    .collect();
                WebResponse::content("text/plain", format!("{identity}|{bits}"))
            }
            "redirect" | "/redirect" => WebResponse::from(ResponsePayload::Redirect {
                is_permanent: false,
                switch_to_get: true,
                location: "/elsewhere".into(),
            }),
            "missing" | "/missing" => WebResponse::from(ResponsePayload::ClientError {
                status: ClientErrorCode::NotFound,
                description_html: Some("<p>no such note</p>".into()),
            }),
            "stream" | "/stream" => WebResponse::from(ResponsePayload::Content {
                status: SuccessCode::Ok,
                mime_type: Some("text/plain".into()),
                encoding: None,
                language: None,
                download: None,
                body: ResponseBody::Stream(Box::pin(stream::iter(vec![
                    Ok(Bytes::from_static(b"first ")),
                    Ok(Bytes::from_static(b"second")),
                ]))),
            }),
            "cookie" | "/cookie" => {
                let mut response = WebResponse::content("text/plain", "baked");
                response.set_cookies.push(SetCookie {
                    name: "flavor".into(),
                    value: "oatmeal".into(),
                    expires: None,
                    path: None,
                    http_only: true,
                });
                response
            }
            _ => match body {
                Some(body) => WebResponse::content(
                    "text/plain",
                    format!("{method} {path} ({} bytes)", body.len()),
                ),
                None => WebResponse::content("text/plain", format!("{method} {path}")),
            },
        }
    }
}

#[async_trait]
impl WebSession for MockWebSession {
    async fn get(&self, path: &str, context: RequestContext) -> Result<WebResponse> {
        self.app.check_connected()?;
        self.app.record("GET", path, context, None);
        Ok(self.respond("GET", path, None))
    }

    async fn post(&self, path: &str, content: RequestContent, context: RequestContext) -> Result<WebResponse> {
        self.app.check_connected()?;
        self.app.record("POST", path, context, Some(content.content.clone()));
        Ok(self.respond("POST", path, Some(&content.content)))
    }

    async fn put(&self, path: &str, content: RequestContent, context: RequestContext) -> Result<WebResponse> {
        self.app.check_connected()?;
        self.app.record("PUT", path, context, Some(content.content.clone()));
        Ok(self.respond("PUT", path, Some(&content.content)))
    }

    async fn delete(&self, path: &str, context: RequestContext) -> Result<WebResponse> {
        self.app.check_connected()?;
        self.app.record("DELETE", path, context, None);
        Ok(WebResponse::no_content())
    }

    async fn post_streaming(
        &self,
        path: &str,
        _mime_type: &str,
        _encoding: Option<&str>,
        context: RequestContext,
    ) -> Result<Box<dyn RequestStream>> {
        self.open_stream("POST-STREAM", path, context)
    }

    async fn put_streaming(
        &self,
        path: &str,
        _mime_type: &str,
        _encoding: Option<&str>,
        context: RequestContext,
    ) -> Result<Box<dyn RequestStream>> {
        self.open_stream("PUT-STREAM", path, context)
    }

    async fn open_websocket(
        &self,
        path: &str,
        context: RequestContext,
        protocols: Vec<String>,
        client_stream: Box<dyn ByteStream>,
    ) -> Result<WebSocketSession> {
        self.app.check_connected()?;
        self.app.record("WS", path, context, None);
        Ok(WebSocketSession {
            protocols: protocols.into_iter().take(1).collect(),
            server_stream: Box::new(EchoStream { client_stream }),
        })
    }
}

impl MockWebSession {
    fn open_stream(&self, method: &str, path: &str, context: RequestContext) -> Result<Box<dyn RequestStream>> {
        if self.app.state.lock().streaming_unimplemented {
            return Err(RpcError::unimplemented("streaming uploads").into());
        }
        self.app.check_connected()?;
        self.app.record(method, path, context, None);
        let (done, _) = watch::channel(false);
        Ok(Box::new(MockRequestStream {
            method: method.to_string(),
            path: path.to_string(),
            received: Mutex::new(Vec::new()),
            expected_size: Mutex::new(None),
            done,
        }))
    }
}

/// Upload stream that answers once the upload is complete
pub struct MockRequestStream {
    method: String,
    path: String,
    received: Mutex<Vec<u8>>,
    expected_size: Mutex<Option<u64>>,
    done: watch::Sender<bool>,
}

#[async_trait]
impl ByteStream for MockRequestStream {
    async fn write(&self, data: Bytes) -> Result<()> {
        self.received.lock().extend_from_slice(&data);
        Ok(())
    }

    async fn done(&self) -> Result<()> {
        self.done.send_replace(true);
        Ok(())
    }
}

#[async_trait]
impl RequestStream for MockRequestStream {
    async fn expect_size(&self, size: u64) -> Result<()> {
        *self.expected_size.lock() = Some(size);
        Ok(())
    }

    async fn get_response(&self) -> Result<WebResponse> {
        let mut done = self.done.subscribe();
        done.wait_for(|done| *done)
            .await
            .map_err(|_| RpcError::disconnected("upload abandoned"))?;
        let received = self.received.lock().len();
        let expected = match *self.expected_size.lock() {
            Some(size) => format!(" of {size}"),
            None => String::new(),
        };
        Ok(WebResponse::content(
            "text/plain",
            format!("{} {} ({received}{expected} bytes)", self.method, self.path),
        ))
    }
}

/// App side of a WebSocket that sends every message straight back
struct EchoStream {
    client_stream: Box<dyn ByteStream>,
}

#[async_trait]
impl ByteStream for EchoStream {
    async fn write(&self, data: Bytes) -> Result<()> {
        self.client_stream.write(data).await
    }

    async fn done(&self) -> Result<()> {
        self.client_stream.done().await
    }
}
