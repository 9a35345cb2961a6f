//! Rate limiting logic and state management.

mod backend;
mod counter;
mod gate;
mod identity;
mod limiter;
mod memory;
mod registry;
mod remote;

pub use backend::WindowStore;
pub use counter::{epoch_millis, Decision, RateLimitConfig, WindowRecord};
pub use gate::{check_request, check_request_at, GateDecision, GateResponse, RATE_LIMIT_EXCEEDED};
pub use identity::{RequestMeta, FORWARDED_FOR_HEADER, REAL_IP_HEADER, USER_ID_HEADER};
pub use limiter::RateLimiter;
pub use memory::MemoryStore;
pub use registry::{LimiterKind, LimiterRegistry};
pub use remote::{CounterClient, KeyTtl, RedisCounter, RemoteStore};
