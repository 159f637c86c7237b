//! Standard capability providers
//!
//! Built-in providers for local testing, the HTTP provider for remote
//! capabilities, and the settings file that wires them into a runtime.

mod debug;
mod http;
mod settings;
mod time;

pub use debug::{EchoProvider, ECHO_ID};
pub use http::HttpCapabilityProvider;
pub use settings::{ProviderSettings, Settings, SettingsError};
pub use time::{DelayProvider, DELAY_ID};

use canvascore::CapabilityContract;
use canvasruntime::ProviderRegistry;
use std::sync::Arc;

/// Register all standard providers with a registry
pub fn register_all(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(EchoProvider));
    registry.register(Arc::new(DelayProvider));
}

/// Node type contracts of the standard providers.
pub fn standard_contracts() -> Vec<CapabilityContract> {
    vec![EchoProvider::contract(), DelayProvider::contract()]
}
