pub mod config;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod upstream;

#[cfg(test)]
mod test_util;

pub use error::GatewayError;
