//! Session registry and transport factory.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | Registry configuration builder |
//! | `entry` | Pending and ready registry entries |
//! | `factory` | Transport plus handler set creation |
//! | `options` | Creation and capacity policies |
//! | `registry` | Singleflight key to transport map |

// ============================================================================
// Submodules
// ============================================================================

/// Registry builder.
pub mod builder;

/// Registry entries.
pub(crate) mod entry;

/// Transport factory.
pub mod factory;

/// Registry policies.
pub mod options;

/// Session registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::RegistryBuilder;
pub use factory::{ChannelFactory, PartialSession, Session, TransportFactory, create_session};
pub use options::RegistryOptions;
pub use registry::SessionRegistry;
