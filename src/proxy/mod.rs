pub mod context;
pub mod handler;
pub mod headers;
pub mod manager;

pub use context::{BoxBody, ClientIp, SessionId};
pub use handler::ReverseProxyHandler;
pub use manager::ReverseProxyManager;
