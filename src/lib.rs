pub mod bucket;
pub mod clock;
pub mod errors;
pub mod gcra;
pub mod limiter;
pub mod limits;
pub mod metrics;
pub mod source;

// Re-export commonly used types
pub use bucket::{Bucket, BucketWithCost};
pub use clock::{Clock, FakeClock, SystemClock};
pub use errors::{LimiterError, Result};
pub use gcra::Decision;
pub use limiter::Limiter;
pub use limits::{
    load_default_limits, load_override_limits, Limit, Limits, Name,
};
pub use source::memory::InMemorySource;
pub use source::redis::{RedisConfig, RedisSource};
pub use source::{Source, SourceError};
