//! Gateway server implementation

pub mod auth;
pub mod channel;
pub mod cors;
pub mod events;
pub mod fault;
pub mod handlers;
pub mod router;
mod server;

pub use auth::{AdmissionGate, ProtectedScope, admission_gate};
pub use channel::{ChannelManager, CloseReason, Connection, ConnectionId, ConnectionState};
pub use cors::OriginPolicy;
pub use events::{EventHandler, EventRegistry, PingHandler};
pub use fault::{ErrorKind, ErrorResponse};
pub use router::{
    AppState, Dispatch, RouteDescriptor, RouteScope, RouteTable, create_router, standard_routes,
};
pub use server::Gateway;
