//! Sliding-window rate limiting and window stores.

mod clock;
mod failover;
mod guard;
mod key;
mod limiter;
mod local;
mod policy;
mod rules;
mod shared;
mod store;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use failover::{FailoverStore, FallbackMode};
pub use guard::{Rejection, RouteGuard};
pub use key::{IdentifierResolver, LimitKey, Subject, KEY_SEPARATOR};
pub use limiter::{Decision, PolicyVerdict, RateLimiter, Verdict};
pub use local::LocalWindowStore;
pub use policy::{AdmissionPolicy, Counting, ScopeKind};
pub use rules::{LimitRule, RouteConfig, RouteTable, RulesConfig, TimeUnit};
pub use shared::{SharedStoreConfig, SharedWindowStore};
pub use store::WindowStore;
pub use window::{Window, WindowSample};
