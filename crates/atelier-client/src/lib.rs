//! Atelier client SDK.
//!
//! Session orchestration for the atelier API:
//!
//! - The access token lives only in memory, mirrored into a synchronous
//!   [`SessionHandle`] so non-async interceptor code can read it.
//! - A proactive refresh fires shortly before token expiry; concurrent
//!   refreshes collapse into a single in-flight request.
//! - Authenticated calls retry exactly once after a silent refresh on 401.
//! - The active company/branch selection persists through a pluggable
//!   [`SelectionStorage`] and is re-applied on restore.
//!
//! Unauthorized-handling is injected explicitly via [`AuthCallbacks`] at
//! construction time; there are no mutable module-global handler slots.
//!
//! # Example
//!
//! ```no_run
//! use atelier_client::{AtelierClient, AuthCallbacks, ClientOptions};
//!
//! # async fn example() -> Result<(), atelier_client::ClientError> {
//! let client = AtelierClient::new(
//!     ClientOptions::new("https://api.atelier.example", "https://app.atelier.example", "fp-1"),
//!     AuthCallbacks::new(|| eprintln!("logged out")),
//! );
//!
//! client.login("owner@example.com", "hunter2-hunter2").await?;
//! let plans = client.get_json("/api/shared/plans").await?;
//! # let _ = plans;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod selection;
mod session;

pub use client::{AtelierClient, AuthCallbacks, ClientOptions, LoginOutcome};
pub use error::ClientError;
pub use selection::{ActiveSelection, MemorySelectionStorage, SelectionStorage};
pub use session::{SessionHandle, TokenSnapshot};
