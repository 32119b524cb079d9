//! Server-side state and session handling

pub mod fanout;
pub mod node;
pub mod room;
pub mod session;
pub mod user;

pub use node::Node;
pub use room::{Room, RoomInfo, Visibility};
pub use session::Session;
pub use user::{LocalUsers, User, UserRecord};
