//! Rate limiting logic and state management.

mod access;
mod algorithm;
mod clock;
mod ddos;
mod key;
mod limiter;
mod resolver;
mod result;
mod rules;
mod stats;

pub use access::AccessControl;
pub use algorithm::Algorithm;
pub use clock::{Clock, ManualClock, SystemClock};
pub use ddos::{BlockedIp, DdosGuard};
pub use key::{mask_ip, route_scope, CounterKey};
pub use limiter::{Decision, Denial, RateLimiter};
pub use resolver::{ClientIdentity, LimitCheck, LimitResolver, Route};
pub use result::{most_restrictive, LimitType, RateLimitResult};
pub use rules::{
    AccessList, DdosConfig, EndpointLimit, FailureMode, Quota, RateLimitConfig, UserTierLimit,
    DEFAULT_TIER,
};
pub use stats::{LimiterStats, StatsSnapshot};
