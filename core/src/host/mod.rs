//! Host-side responder: exposes local capabilities over the same protocol
pub mod provider;
pub mod server;

pub use provider::{CapabilityProvider, RegistryProvider};
pub use server::{normalize_output, HostServer};
