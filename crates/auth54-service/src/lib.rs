//! Service runtime for the auth54 federation.
//!
//! `auth54-core` defines what federation members agree on; this crate runs
//! one member:
//!
//! - [`config`]: TOML configuration with fail-closed validation
//! - [`store`]: the SQLite replica (actors, overrides, salts, sessions)
//! - [`context`]: shared per-process state
//! - [`channel`]: the signed service-to-service channel
//! - [`session`]: session lifecycle and dependent fan-out
//! - [`permission`]: capability resolution over the replicated overrides
//! - [`masquerade`]: acting as another actor
//! - [`sync`]: hash-based replica convergence and forced sync
//! - [`handlers`]: the protocol endpoint dispatcher
//! - [`telemetry`]: logging setup

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod masquerade;
pub mod permission;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;

pub use channel::{CallOptions, ChannelError, Peer, ServiceChannel};
pub use config::{ConfigError, ServiceConfig};
pub use context::ServiceContext;
pub use error::ServiceError;
pub use handlers::{Method, Request, Response, dispatch};
pub use masquerade::{MasqueradeOutcome, start_masquerade, stop_masquerade};
pub use permission::{GrantSource, PermissionEngine, ResolvedGrant};
pub use session::{DependentOutcome, SessionEngine, SessionOutcome};
pub use store::{Db, StoreError};
pub use sync::{SyncAction, SyncEngine};
