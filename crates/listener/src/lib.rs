//! HTTP surface of the Gmail push relay.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /webhook/gmail-push` | Push notifications; full pipeline |
//! | `GET /health` | Liveness; never touches the pipeline |
//! | `POST /test` | Operator-supplied payloads; skips origin authentication, guarded by its own token. Only mounted when a token is configured |
//!
//! Each pipeline run is spawned onto its own task so a client disconnect never
//! cancels it mid-run. The handler waits up to [`ListenerConfig::run_deadline`]
//! for the outcome and otherwise answers `500` while the run carries on and
//! logs its own terminal state.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** Request parsing and status mapping live here. The
//! [`dispatch`] crate sees only [`pipeline::InboundEvent`].

mod request;
mod response;
mod server;

pub use request::{inbound_headers, origin_key, TEST_TOKEN_HEADER};
pub use response::{status_for, DispatchReply};
pub use server::{router, AppState, ListenerConfig};
