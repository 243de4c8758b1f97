//! Rate limiting middleware for HTTP requests.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use futures::future::BoxFuture;
use http::{Request, Response};
use tower::{Layer, Service};

use super::identity::{extract_identity, extract_route};
use super::response::{apply_headers, denial_response};
use crate::ratelimit::{Decision, RateLimiter};

/// Wraps a service with rate limiting.
#[derive(Clone)]
pub struct RateLimitLayer(Arc<RateLimiter>);

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self(limiter)
    }
}

impl<S> Layer<S> for RateLimitLayer
where
    S: Send + Clone,
{
    type Service = RateLimitService<S>;

    fn layer(&self, next: S) -> Self::Service {
        RateLimitService {
            next,
            limiter: self.0.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    next: S,
    limiter: Arc<RateLimiter>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<Body>, Error = Infallible>
        + Send
        + Clone
        + 'static,
    S::Future: Send,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; swap so the readied service handles this call.
        let clone = self.next.clone();
        let mut next = std::mem::replace(&mut self.next, clone);
        let limiter = self.limiter.clone();

        Box::pin(async move {
            let identity = extract_identity(&req);
            let route = extract_route(&req);

            match limiter.check(&route, &identity).await {
                Decision::Bypass => next.call(req).await,
                Decision::Allowed(result) => {
                    let mut response = next.call(req).await?;
                    if let Some(result) = result {
                        apply_headers(response.headers_mut(), &result);
                    }
                    Ok(response)
                }
                Decision::Denied(denial) => Ok(denial_response(&denial)),
            }
        })
    }
}
