//! Command grammar for the client line protocol
//!
//! Tokens are space-separated; `SEND` and `SET .. DESCRIPTION TO` take the
//! remainder of the line as free text.

/// A parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `LOGIN <user_number> <user_name>`
    Login {
        user_number: String,
        user_name: String,
    },

    /// `CREATE ROOM <room_name>`
    CreateRoom { name: String },

    /// `CREATE PRIVATE ROOM <room_name>`
    CreatePrivateRoom { name: String },

    /// `JOIN ROOM <room_name>`
    JoinRoom { name: String },

    /// `ROOM <room_name> LEAVE`
    RoomLeave { room: String },

    /// `ROOM <room_name> REMOVE MEMBER <user_number>`
    RoomRemoveMember { room: String, user_number: String },

    /// `ROOM <room_name> SET DESCRIPTION TO <description...>`
    RoomSetDescription { room: String, description: String },

    /// `ROOM <room_name> GET DESCRIPTION`
    RoomGetDescription { room: String },

    /// `ROOM <room_name> GET MEMBERS`
    RoomGetMembers { room: String },

    /// `ROOM <room_name> INSPECT`
    RoomInspect { room: String },

    /// `ROOM <room_name> ON WHICH NODE ?`
    RoomWhichNode { room: String },

    /// `ROOM <room_name> DELETE`
    RoomDelete { room: String },

    /// `ROOM <room_name> SEND <message...>`
    RoomSend { room: String, message: String },

    /// `ROOM <room_name> INVITE <user_number>`
    RoomInvite { room: String, user_number: String },

    /// `LIST JOINED ROOMS`
    ListJoinedRooms,

    /// `LIST ACCESSIBLE ROOMS`
    ListAccessibleRooms,

    /// `GET MYSELF`
    GetMyself,

    /// `SET MY DESCRIPTION TO <description...>`
    SetMyDescription { description: String },

    /// `SET MY USER NAME TO <user_name>`
    SetMyUserName { user_name: String },

    /// `LOG OUT`
    LogOut,
}

impl Command {
    /// Whether the command is allowed before LOGIN
    pub fn allowed_before_login(&self) -> bool {
        matches!(self, Command::Login { .. })
    }
}

/// Split off the next space-separated token. Returns the token and the rest
/// of the line with leading spaces stripped.
fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start_matches(' ');
    if input.is_empty() {
        return None;
    }
    match input.find(' ') {
        Some(idx) => Some((&input[..idx], input[idx + 1..].trim_start_matches(' '))),
        None => Some((input, "")),
    }
}

/// Parse one line into a command. Returns `None` for anything the grammar
/// does not cover, including trailing garbage after a complete command.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, rest) = next_token(line)?;

    match head {
        "LOGIN" => {
            let (user_number, rest) = next_token(rest)?;
            let (user_name, rest) = next_token(rest)?;
            rest.is_empty().then(|| Command::Login {
                user_number: user_number.to_string(),
                user_name: user_name.to_string(),
            })
        }

        "CREATE" => match next_token(rest)? {
            ("ROOM", rest) => {
                let (name, rest) = next_token(rest)?;
                rest.is_empty().then(|| Command::CreateRoom {
                    name: name.to_string(),
                })
            }
            ("PRIVATE", rest) => {
                let (kw, rest) = next_token(rest)?;
                if kw != "ROOM" {
                    return None;
                }
                let (name, rest) = next_token(rest)?;
                rest.is_empty().then(|| Command::CreatePrivateRoom {
                    name: name.to_string(),
                })
            }
            _ => None,
        },

        "JOIN" => {
            let (kw, rest) = next_token(rest)?;
            if kw != "ROOM" {
                return None;
            }
            let (name, rest) = next_token(rest)?;
            rest.is_empty().then(|| Command::JoinRoom {
                name: name.to_string(),
            })
        }

        "ROOM" => {
            let (room, rest) = next_token(rest)?;
            let room = room.to_string();
            parse_room_command(room, rest)
        }

        "LIST" => match next_token(rest)? {
            ("JOINED", rest) => {
                let (kw, rest) = next_token(rest)?;
                (kw == "ROOMS" && rest.is_empty()).then_some(Command::ListJoinedRooms)
            }
            ("ACCESSIBLE", rest) => {
                let (kw, rest) = next_token(rest)?;
                (kw == "ROOMS" && rest.is_empty()).then_some(Command::ListAccessibleRooms)
            }
            _ => None,
        },

        "GET" => {
            let (kw, rest) = next_token(rest)?;
            (kw == "MYSELF" && rest.is_empty()).then_some(Command::GetMyself)
        }

        "SET" => {
            let (kw, rest) = next_token(rest)?;
            if kw != "MY" {
                return None;
            }
            match next_token(rest)? {
                ("DESCRIPTION", rest) => {
                    let (kw, free) = next_token(rest)?;
                    (kw == "TO").then(|| Command::SetMyDescription {
                        description: free.to_string(),
                    })
                }
                ("USER", rest) => {
                    let (kw, rest) = next_token(rest)?;
                    if kw != "NAME" {
                        return None;
                    }
                    let (kw, rest) = next_token(rest)?;
                    if kw != "TO" {
                        return None;
                    }
                    let (user_name, rest) = next_token(rest)?;
                    rest.is_empty().then(|| Command::SetMyUserName {
                        user_name: user_name.to_string(),
                    })
                }
                _ => None,
            }
        }

        "LOG" => {
            let (kw, rest) = next_token(rest)?;
            (kw == "OUT" && rest.is_empty()).then_some(Command::LogOut)
        }

        _ => None,
    }
}

/// Parse the sub-grammar after `ROOM <room_name>`.
fn parse_room_command(room: String, rest: &str) -> Option<Command> {
    match next_token(rest)? {
        ("LEAVE", rest) => rest.is_empty().then_some(Command::RoomLeave { room }),

        ("REMOVE", rest) => {
            let (kw, rest) = next_token(rest)?;
            if kw != "MEMBER" {
                return None;
            }
            let (user_number, rest) = next_token(rest)?;
            rest.is_empty().then(|| Command::RoomRemoveMember {
                room,
                user_number: user_number.to_string(),
            })
        }

        ("SET", rest) => {
            let (kw, rest) = next_token(rest)?;
            if kw != "DESCRIPTION" {
                return None;
            }
            let (kw, free) = next_token(rest)?;
            (kw == "TO").then(|| Command::RoomSetDescription {
                room,
                description: free.to_string(),
            })
        }

        ("GET", rest) => match next_token(rest)? {
            ("DESCRIPTION", rest) => {
                rest.is_empty().then_some(Command::RoomGetDescription { room })
            }
            ("MEMBERS", rest) => rest.is_empty().then_some(Command::RoomGetMembers { room }),
            _ => None,
        },

        ("INSPECT", rest) => rest.is_empty().then_some(Command::RoomInspect { room }),

        ("ON", rest) => {
            let (kw, rest) = next_token(rest)?;
            if kw != "WHICH" {
                return None;
            }
            let (kw, rest) = next_token(rest)?;
            if kw != "NODE" {
                return None;
            }
            let (kw, rest) = next_token(rest)?;
            (kw == "?" && rest.is_empty()).then_some(Command::RoomWhichNode { room })
        }

        ("DELETE", rest) => rest.is_empty().then_some(Command::RoomDelete { room }),

        ("SEND", free) => {
            if free.is_empty() {
                return None;
            }
            Some(Command::RoomSend {
                room,
                message: free.to_string(),
            })
        }

        ("INVITE", rest) => {
            let (user_number, rest) = next_token(rest)?;
            rest.is_empty().then(|| Command::RoomInvite {
                room,
                user_number: user_number.to_string(),
            })
        }

        _ => None,
    }
}
