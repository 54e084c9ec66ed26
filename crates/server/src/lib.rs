//! HTTP surface for the dispatch core: JSON endpoints for profiles and
//! orders, plus a server-sent event stream for live order changes.

mod auth;
pub mod config;
mod http_server;

pub use auth::{ACTOR_HEADER, ROLE_HEADER};
pub use http_server::{build_router, run_http_server};
