//! Resilient gateway to the room directory.
//!
//! The only component permitted to issue remote network calls. Composes a
//! narrow [`Transport`] seam with rate-limit lanes, a classification-driven
//! retry policy, restartable history pagination, and a local state cache
//! that makes repeated reads free and repeated identical writes no-ops.

pub mod cache;
pub mod gateway;
pub mod limiter;
pub mod pager;
pub mod retry;
pub mod transport;
pub mod types;

pub use cache::StateCache;
pub use gateway::Gateway;
pub use limiter::{Lane, RateLimiter};
pub use pager::{Direction, MessagePager};
pub use retry::RetryPolicy;
pub use transport::{HttpTransport, Method, Request, Transport};
