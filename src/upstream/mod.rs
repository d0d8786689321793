pub mod balancer;
pub mod group;
pub mod health;
pub mod instance;
pub mod loadbalance;
pub mod passive;
pub mod pool;

pub use balancer::Balancer;
pub use group::{UpstreamGroup, UpstreamSet};
pub use health::{ActiveHealthChecker, HealthProbe};
pub use instance::{StateChange, StateChangeKind, Upstream};
pub use loadbalance::{LoadBalancer, SelectionContext};
pub use passive::PassiveRecovery;
pub use pool::{ConnectionPool, HttpClient};
