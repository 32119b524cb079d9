//! Response envelopes written back to clients
//!
//! Three shapes exist: direct replies, room-scoped replies, and broadcast
//! chat lines. Every line is `\r\n`-terminated.

/// Reply sent when a command is received before LOGIN
pub const NOT_LOGGED_IN: &str = "You are not logged in\r\n";

/// Reply sent when a line does not parse as any command
pub const UNKNOWN_COMMAND: &str = "Unknown command !\r\n";

/// Emitted before tearing a session down on an unexpected transport error
pub const TRANSPORT_ERROR: &str = "ERROR\r\n";

/// Direct reply: `## <text> ##`
pub fn direct(text: &str) -> String {
    format!("## {} ##\r\n", text)
}

/// Room-scoped reply: `(<room>): ## <text> ##`
pub fn room_scoped(room: &str, text: &str) -> String {
    format!("({}): ## {} ##\r\n", room, text)
}

/// Broadcast chat line: `<user_name> (<room>): <message>`
pub fn chat_line(user_name: &str, room: &str, message: &str) -> String {
    format!("{} ({}): {}\r\n", user_name, room, message)
}
