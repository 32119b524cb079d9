//! Client line protocol
//!
//! Commands arrive as single `\n`-terminated lines and are parsed into
//! [`Command`] records; replies are formatted through the envelope helpers.

pub mod command;
pub mod envelope;

pub use command::{parse, Command};
pub use envelope::{chat_line, direct, room_scoped, NOT_LOGGED_IN, UNKNOWN_COMMAND};
