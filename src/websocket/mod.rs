pub mod handler;
pub mod msg_operation_handler;
pub mod msg_ping_handler;
pub mod msg_presence_handler;

pub use handler::websocket_handler;
