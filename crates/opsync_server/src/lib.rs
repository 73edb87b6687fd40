//! # opsync server
//!
//! The boundary an HTTP layer calls into.
//!
//! This crate provides:
//! - Request handlers for push, pull, confirm, get, search and cursor reset
//! - Authentication of devices (HMAC-SHA256 tokens)
//! - Server lifecycle: journal, realtime notifier, retention task, shutdown
//! - Async calls with request timeouts and long-poll waits for updates
//!
//! # Architecture
//!
//! A [`SyncServer`] owns one `OperationLog` and the `RealtimeNotifier` it
//! announces pushes through. Every request is made on behalf of an
//! [`AuthenticatedDevice`]; the server never reads the user or device from a
//! request body.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust
//! use opsync_protocol::{DeviceId, UserId};
//! use opsync_server::{ServerConfig, SyncServer};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = SyncServer::open(ServerConfig::default().with_auth(secret)).unwrap();
//!
//! let token = server
//!     .issue_token(&UserId::from("alice"), &DeviceId::from("phone"))
//!     .unwrap();
//! let caller = server.authenticate(&token).unwrap();
//! assert_eq!(caller.device.as_str(), "phone");
//! ```
//!
//! # Protocol
//!
//! 1. The device pushes operations it authored
//! 2. Other devices of the user are signalled and pull what they have not
//!    confirmed
//! 3. Devices confirm what they durably applied
//! 4. Operations confirmed by every active device are pruned after a grace
//!    period

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{AuthConfig, AuthenticatedDevice, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::SyncServer;
