//! Synchronous, I/O-free domain logic for the signaling service: the
//! session registry, the rate limiter, and the in-memory allow-list model.
//! Nothing here depends on an async runtime — background reaping runs on
//! plain OS threads, the same way `crates/service` in the codebase this was
//! grounded on keeps its session manager runtime-agnostic.

pub mod allow_list;
pub mod ids;
pub mod rate_limit;
pub mod session;

pub use allow_list::{AllowList, AllowedUser};
pub use ids::generate_token;
pub use rate_limit::{CheckResult, Policy, RateLimiter};
pub use session::{JoinError, Peer, Session, SessionRegistry, TtlConfig};
