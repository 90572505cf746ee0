//! Rate limiting logic and state management.

mod clock;
mod key;
mod limiter;
mod policy;
mod record;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::RateLimitKey;
pub use limiter::{RateLimiter, Verdict};
pub use policy::{PolicyPreset, PolicyTable, RateLimitPolicy};
pub use record::CounterRecord;
pub use sweeper::{Sweeper, DEFAULT_SWEEP_INTERVAL};
