//! The collaboration session core: rooms, their persistence, and the
//! per-connection gateway in front of them.

pub mod gateway;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod room;

pub use gateway::{ActiveSession, CloseReason, Handshake, SessionGateway};
pub use persistence::PersistenceBridge;
pub use registry::{RegistryOptions, RoomError, RoomRegistry};
