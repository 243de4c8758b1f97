//! HTTP surface: middleware, identity extraction, responses and admin routes.

mod admin;
mod identity;
mod layer;
mod response;
mod server;

pub use admin::admin_router;
pub use identity::{client_ip, extract_identity, extract_route, AuthenticatedUser, UNKNOWN_IP};
pub use layer::{RateLimitLayer, RateLimitService};
pub use response::{apply_headers, codes, denial_response, describe};
pub use response::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_RATELIMIT_TYPE};
pub use server::HttpServer;
