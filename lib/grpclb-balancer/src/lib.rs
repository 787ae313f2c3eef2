//! Client-side load balancing over discovered addresses
pub mod load_balancer;

pub use load_balancer::{LoadBalancer, LoadBalancingStrategy};
