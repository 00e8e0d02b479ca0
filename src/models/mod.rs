pub mod comment;
pub mod diagnostics;
pub mod doc;
pub mod error;
pub mod health;
pub mod lorodoc;
pub mod messages;

pub use comment::*;
pub use diagnostics::*;
pub use doc::*;
pub use error::*;
pub use health::*;
pub use messages::*;
