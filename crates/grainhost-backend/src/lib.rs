//! # Grainhost Backend
//!
//! Everything between the kernel and the processes running grains:
//!
//! - [`rpc`]: capability interfaces of the backend, supervisors, views and sessions
//! - [`GrainManager`]: single-flight grain startup with one restart-and-retry
//!   on disconnect
//! - [`quota`]: plan limits that block grain creation and startup
//! - [`session`]: opening, keeping alive and collecting interactive sessions

#![forbid(unsafe_code)]

pub mod manager;
pub mod quota;
pub mod rpc;
pub mod session;

pub use manager::{GrainManager, RunningGrain};
pub use quota::{excessively_over_quota, over_quota, QuotaStatus};
pub use rpc::{
    AcceptedType, Backend, ByteStream, ClientErrorCode, CookieExpires, RequestContent,
    RequestContext, RequestStream, ResponseBody, ResponsePayload, SessionContext, SessionParams,
    SetCookie, StartGrainParams, SuccessCode, Supervisor, UiView, UserInfo, WebResponse,
    WebSession, WebSocketSession,
};
pub use session::{
    gc_sessions, generate_session_id, host_id_for_session, keep_session_alive, open_session,
    open_session_from_api_token, spawn_session_gc, OpenedSession, WebkeySession,
};
