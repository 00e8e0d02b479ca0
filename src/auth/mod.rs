pub mod identity;
pub mod policy;

pub use identity::{extract_token, IdentityGate, IdentityProvider, JwtIdentityProvider, Principal};
pub use policy::{AccessPolicy, Grant, Permission};
