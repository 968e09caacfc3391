pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod permit;
pub mod query;
pub mod server;
pub mod service;
pub mod store;

pub use error::{ActilogError, Result};
pub use event::{ContextMap, Event, EventId, Initiator, Level};
pub use permit::{CategoryGrant, PermissionResolver, StaticGrants};
pub use query::{QueryEngine, QueryRequest, QueryResult};
pub use service::LogService;
pub use store::{AppendRequest, EventStore};
