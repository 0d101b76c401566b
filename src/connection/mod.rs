pub mod backpressure;
pub mod connection;
pub mod rate_limit;
pub mod state_machine;

pub use backpressure::{OutboundQueue, PressureStrategy};
pub use connection::{Connection, ConnectionMetadata, ConnectionStats, MessageDispatch, Platform};
pub use rate_limit::{RateLimitStrategy, RateLimiterRegistry};
pub use state_machine::{ConnectionState, InvalidTransition};
