//! Reverse TCP tunnel.
//!
//! A public relay accepts both external callers and connectors that a local
//! agent dials out from behind NAT. Each caller is paired with one idle
//! connector for the lifetime of its session; the agent bridges that connector
//! to the target service. Connector traffic is framed (see `protocol`), caller
//! traffic is raw.

pub mod agent;
pub mod connector;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod transport;
