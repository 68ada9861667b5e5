//! Capability-RPC interfaces of the grain backend
//!
//! The kernel never talks to a sandbox directly. It holds capabilities: a
//! [`Backend`] that starts supervisors, a [`Supervisor`] per running grain, the
//! grain's main [`UiView`] and the [`WebSession`]s created on it. Every call
//! may fail with an [`RpcError`](grainhost_core::RpcError); `Disconnected`
//! means the grain process went away and a restart may help, `Unimplemented`
//! means the app predates the method and the caller should fall back.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use grainhost_core::{
    AccountId, Command, GrainId, GrainhostError, IdentityId, LocalizedText, PackageId,
    PermissionSet, Result, RpcError, SessionId, ViewInfo,
};
use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;

/// Arguments of [`Backend::start_grain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartGrainParams {
    /// Owning account
    pub owner: AccountId,
    /// Grain to start
    pub grain_id: GrainId,
    /// Package providing the app
    pub package_id: PackageId,
    /// Normalised launch command
    pub command: Command,
    /// First start of a freshly created grain
    pub is_new: bool,
    /// Package is a dev app
    pub dev_mode: bool,
}

/// The process host that launches grain supervisors
#[async_trait]
pub trait Backend: Send + Sync {
    /// Launch (or reconnect to) a grain's supervisor and wait until it is up
    async fn start_grain(&self, params: StartGrainParams) -> Result<Arc<dyn Supervisor>>;

    /// Supervisor capability of a grain that may or may not be running
    async fn get_grain(&self, owner: &AccountId, grain_id: &GrainId) -> Result<Arc<dyn Supervisor>>;

    /// Delete a grain's storage
    async fn delete_grain(&self, owner: &AccountId, grain_id: &GrainId) -> Result<()>;

    /// Bytes of storage used by an account's grains
    async fn user_storage_usage(&self, account: &AccountId) -> Result<u64>;
}

/// Supervisor of one running grain
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// The grain's main view
    async fn main_view(&self) -> Result<Arc<dyn UiView>>;

    /// Postpone idle shutdown
    async fn keep_alive(&self) -> Result<()>;

    /// Stop the grain; a clean stop surfaces as `Disconnected`
    async fn shutdown(&self) -> Result<()>;
}

/// Who a session is for
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    /// Display name
    pub display_name: LocalizedText,
    /// Handle the app should suggest
    pub preferred_handle: String,
    /// Identity, absent for anonymous visitors
    pub identity_id: Option<IdentityId>,
    /// Permissions held on the grain
    pub permissions: PermissionSet,
    /// `permissions` packed little-endian, for apps built against the old interface
    pub deprecated_permissions_blob: Vec<u8>,
}

impl UserInfo {
    /// Anonymous visitor holding no permissions yet
    pub fn anonymous() -> Self {
        Self {
            display_name: LocalizedText::plain("Anonymous User"),
            preferred_handle: "anonymous".to_string(),
            identity_id: None,
            permissions: PermissionSet::new(),
            deprecated_permissions_blob: Vec::new(),
        }
    }

    /// A logged-in identity holding no permissions yet
    pub fn identity(identity_id: IdentityId) -> Self {
        Self {
            display_name: LocalizedText::plain(identity_id.as_str()),
            preferred_handle: identity_id.as_str().to_string(),
            identity_id: Some(identity_id),
            permissions: PermissionSet::new(),
            deprecated_permissions_blob: Vec::new(),
        }
    }

    /// Attach the proven permissions
    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.deprecated_permissions_blob = permissions.to_bytes();
        self.permissions = permissions;
        self
    }
}

/// Context passed to the app alongside a new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Grain the session is on
    pub grain_id: GrainId,
    /// Interactive session, absent for API sessions
    pub session_id: Option<SessionId>,
    /// Logged-in account
    pub account_id: Option<AccountId>,
}

/// Session type requested from [`UiView::new_session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionParams {
    /// Browser-facing session
    Web {
        /// Origin the grain is served from
        base_path: String,
        /// Client user agent
        user_agent: String,
        /// Client language preferences, most preferred first
        accept_languages: Vec<String>,
    },
    /// Machine-facing session
    Api {
        /// Client address, only when the client opted in
        remote_address: Option<Ipv6Addr>,
    },
}

impl SessionParams {
    /// Whether this is an API session
    pub fn is_api(&self) -> bool {
        matches!(self, SessionParams::Api { .. })
    }
}

/// A grain's user interface
#[async_trait]
pub trait UiView: Send + Sync {
    /// Roles and permissions the app declares
    async fn view_info(&self) -> Result<ViewInfo>;

    /// Open a session for a user
    async fn new_session(
        &self,
        user: UserInfo,
        context: SessionContext,
        params: SessionParams,
    ) -> Result<Arc<dyn WebSession>>;
}

/// One `Accept` header entry
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedType {
    /// Media range
    pub mime_type: String,
    /// Quality factor when given
    pub q_value: Option<f32>,
}

/// Per-request context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    /// Cookies other than the session cookie
    pub cookies: Vec<(String, String)>,
    /// Parsed `Accept` header
    pub accept: Vec<AcceptedType>,
}

/// Buffered request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContent {
    /// `Content-Type`, `application/octet-stream` when absent
    pub mime_type: String,
    /// `Content-Encoding`
    pub encoding: Option<String>,
    /// Body bytes
    pub content: Bytes,
}

/// Outbound byte stream
#[async_trait]
pub trait ByteStream: Send + Sync {
    /// Send a chunk
    async fn write(&self, data: Bytes) -> Result<()>;

    /// No more chunks follow
    async fn done(&self) -> Result<()>;
}

/// Upload stream of a streaming POST or PUT
#[async_trait]
pub trait RequestStream: ByteStream {
    /// Announce the total upload size; apps may leave this unimplemented
    async fn expect_size(&self, _size: u64) -> Result<()> {
        Err(RpcError::unimplemented("expectSize").into())
    }

    /// The app's response; may resolve before the upload completes
    async fn get_response(&self) -> Result<WebResponse>;
}

/// Result of [`WebSession::open_websocket`]
pub struct WebSocketSession {
    /// Sub-protocols the app accepted
    pub protocols: Vec<String>,
    /// Client-to-app bytes
    pub server_stream: Box<dyn ByteStream>,
}

impl fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

/// HTTP-shaped session on a grain
#[async_trait]
pub trait WebSession: Send + Sync {
    /// GET
    async fn get(&self, path: &str, context: RequestContext) -> Result<WebResponse>;

    /// Buffered POST
    async fn post(&self, path: &str, content: RequestContent, context: RequestContext) -> Result<WebResponse>;

    /// Buffered PUT
    async fn put(&self, path: &str, content: RequestContent, context: RequestContext) -> Result<WebResponse>;

    /// DELETE
    async fn delete(&self, path: &str, context: RequestContext) -> Result<WebResponse>;

    /// Streaming POST
    async fn post_streaming(
        &self,
        _path: &str,
        _mime_type: &str,
        _encoding: Option<&str>,
        _context: RequestContext,
    ) -> Result<Box<dyn RequestStream>> {
        Err(RpcError::unimplemented("postStreaming").into())
    }

    /// Streaming PUT
    async fn put_streaming(
        &self,
        _path: &str,
        _mime_type: &str,
        _encoding: Option<&str>,
        _context: RequestContext,
    ) -> Result<Box<dyn RequestStream>> {
        Err(RpcError::unimplemented("putStreaming").into())
    }

    /// Raw WebSocket; `client_stream` carries app-to-client bytes
    async fn open_websocket(
        &self,
        path: &str,
        context: RequestContext,
        protocols: Vec<String>,
        client_stream: Box<dyn ByteStream>,
    ) -> Result<WebSocketSession>;
}

/// 2xx codes of a content response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessCode {
    /// 200
    #[default]
    Ok,
    /// 201
    Created,
    /// 202
    Accepted,
}

impl SuccessCode {
    /// Numeric status
    pub fn status(self) -> u16 {
        match self {
            SuccessCode::Ok => 200,
            SuccessCode::Created => 201,
            SuccessCode::Accepted => 202,
        }
    }
}

/// 4xx codes an app may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorCode {
    /// 400
    BadRequest,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed,
    /// 406
    NotAcceptable,
    /// 409
    Conflict,
    /// 410
    Gone,
    /// 413
    RequestEntityTooLarge,
    /// 414
    RequestUriTooLong,
    /// 415
    UnsupportedMediaType,
    /// 418
    ImATeapot,
}

impl ClientErrorCode {
    /// Numeric status and reason phrase
    pub fn status(self) -> (u16, &'static str) {
        match self {
            ClientErrorCode::BadRequest => (400, "Bad Request"),
            ClientErrorCode::Forbidden => (403, "Forbidden"),
            ClientErrorCode::NotFound => (404, "Not Found"),
            ClientErrorCode::MethodNotAllowed => (405, "Method Not Allowed"),
            ClientErrorCode::NotAcceptable => (406, "Not Acceptable"),
            ClientErrorCode::Conflict => (409, "Conflict"),
            ClientErrorCode::Gone => (410, "Gone"),
            ClientErrorCode::RequestEntityTooLarge => (413, "Request Entity Too Large"),
            ClientErrorCode::RequestUriTooLong => (414, "Request-URI Too Long"),
            ClientErrorCode::UnsupportedMediaType => (415, "Unsupported Media Type"),
            ClientErrorCode::ImATeapot => (418, "I'm a teapot"),
        }
    }
}

/// Expiry of an app-set cookie
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieExpires {
    /// Unix seconds
    Absolute(i64),
    /// Seconds from now
    Relative(u64),
}

/// Cookie the app asks to set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    /// Name
    pub name: String,
    /// Value
    pub value: String,
    /// Session cookie when absent
    pub expires: Option<CookieExpires>,
    /// `Path` attribute
    pub path: Option<String>,
    /// `HttpOnly` attribute
    pub http_only: bool,
}

impl SetCookie {
    /// `Set-Cookie` header value
    pub fn header_value(&self) -> String {
        let mut value = format!("{}={}", self.name, self.value);
        match self.expires {
            Some(CookieExpires::Absolute(secs)) => {
                if let Some(at) = chrono::DateTime::from_timestamp(secs, 0) {
                    value.push_str(&format!("; Expires={}", at.format("%a, %d %b %Y %H:%M:%S GMT")));
                }
            }
            Some(CookieExpires::Relative(secs)) => value.push_str(&format!("; Max-Age={secs}")),
            None => {}
        }
        if let Some(path) = &self.path {
            value.push_str(&format!("; Path={path}"));
        }
        if self.http_only {
            value.push_str("; HttpOnly");
        }
        value
    }
}

/// Body of a content response
pub enum ResponseBody {
    /// Whole body
    Bytes(Bytes),
    /// Body streamed by the app
    Stream(BoxStream<'static, Result<Bytes>>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Kind-specific part of a [`WebResponse`]
#[derive(Debug)]
pub enum ResponsePayload {
    /// 2xx with a body
    Content {
        /// Status
        status: SuccessCode,
        /// `Content-Type`
        mime_type: Option<String>,
        /// `Content-Encoding`
        encoding: Option<String>,
        /// `Content-Language`
        language: Option<String>,
        /// Offer the body as a download under this file name
        download: Option<String>,
        /// Body
        body: ResponseBody,
    },
    /// 204, or 205 when the form should be reset
    NoContent {
        /// Reset the submitting form
        should_reset_form: bool,
    },
    /// 3xx
    Redirect {
        /// 301/308 rather than 303/307
        is_permanent: bool,
        /// Client should follow with GET
        switch_to_get: bool,
        /// Target
        location: String,
    },
    /// 4xx
    ClientError {
        /// Status
        status: ClientErrorCode,
        /// Error page
        description_html: Option<String>,
    },
    /// 500
    ServerError {
        /// Error page
        description_html: Option<String>,
    },
}

/// App response to one request
#[derive(Debug)]
pub struct WebResponse {
    /// Cookies to set; only honoured on session hosts
    pub set_cookies: Vec<SetCookie>,
    /// Response
    pub payload: ResponsePayload,
}

impl WebResponse {
    /// 200 with a buffered body
    pub fn content(mime_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::from(ResponsePayload::Content {
            status: SuccessCode::Ok,
            mime_type: Some(mime_type.into()),
            encoding: None,
            language: None,
            download: None,
            body: ResponseBody::Bytes(body.into()),
        })
    }

    /// 204
    pub fn no_content() -> Self {
        Self::from(ResponsePayload::NoContent {
            should_reset_form: false,
        })
    }
}

impl From<ResponsePayload> for WebResponse {
    fn from(payload: ResponsePayload) -> Self {
        Self {
            set_cookies: Vec::new(),
            payload,
        }
    }
}

/// Old apps report a missing method as a generic failure mentioning it
pub fn is_unimplemented_method(error: &GrainhostError) -> bool {
    match error {
        GrainhostError::Rpc(rpc) => {
            error.is_unimplemented()
                || (rpc.kind == grainhost_core::RpcErrorKind::Failed
                    && rpc.message.contains("not implemented"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_cookie_header() {
        let cookie = SetCookie {
            name: "a".into(),
            value: "1".into(),
            expires: Some(CookieExpires::Relative(60)),
            path: Some("/x".into()),
            http_only: true,
        };
        assert_eq!(cookie.header_value(), "a=1; Max-Age=60; Path=/x; HttpOnly");

        let absolute = SetCookie {
            expires: Some(CookieExpires::Absolute(0)),
            path: None,
            http_only: false,
            ..cookie
        };
        assert_eq!(absolute.header_value(), "a=1; Expires=Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn test_permission_blob_packing() {
        let user = UserInfo::anonymous().with_permissions(PermissionSet::from(vec![
            true, false, false, false, false, false, false, false, false, true,
        ]));
        assert_eq!(user.deprecated_permissions_blob, vec![0b0000_0001, 0b0000_0010]);
    }

    #[test]
    fn test_old_apps_unimplemented_detection() {
        assert!(is_unimplemented_method(&RpcError::unimplemented("x").into()));
        assert!(is_unimplemented_method(&RpcError::failed("method not implemented").into()));
        assert!(!is_unimplemented_method(&RpcError::failed("boom").into()));
        assert!(!is_unimplemented_method(&GrainhostError::internal("not implemented")));
    }
}
