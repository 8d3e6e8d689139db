//! Built-in plugins
//!
//! - `auth`: static username/password list, plaintext or argon2 hashes
//! - `acl`: per-role topic patterns for publish and subscribe
//! - `driver`: forwards login decisions to an external device driver
//!
//! `auth` and `acl` are registered by
//! [`PluginRegistry::with_defaults`](crate::hooks::PluginRegistry::with_defaults);
//! `driver` needs a live connector and is registered by the embedding
//! application through [`driver::register`].

pub mod acl;
pub mod auth;
pub mod driver;

pub use acl::AclPlugin;
pub use auth::AuthPlugin;
pub use driver::{DriverConnector, DriverDecision, DriverPlugin, DriverRequest};
