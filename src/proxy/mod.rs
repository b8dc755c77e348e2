pub mod circuit_breaker;
pub mod engine;
pub mod load_balancer;
pub mod rate_limiter;

pub use circuit_breaker::CircuitBreaker;
pub use engine::{router, AppState, Balancer};
pub use load_balancer::LoadBalancer;
pub use rate_limiter::RateLimiter;
