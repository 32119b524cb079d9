//! Client connection sessions
//!
//! One task per accepted TCP connection: read a line, parse, enforce the
//! login gate, dispatch, reply. A dedicated write task is the only writer to
//! the socket, so direct replies and fanout lines never interleave mid-line.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch;
use crate::protocol::{self, envelope};
use crate::server::node::Node;
use crate::server::user::User;

/// Per-connection state handed to the dispatcher
pub struct Session {
    /// Connection id, the thing a User is bound to
    pub conn_id: String,
    /// Line channel consumed by this connection's write task
    pub outbox: mpsc::UnboundedSender<String>,
    /// Bound user once LOGIN succeeded
    pub user: Option<Arc<User>>,
}

/// Run one client session to completion
pub async fn run(node: Arc<Node>, stream: TcpStream, addr: SocketAddr) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let conn_id = Uuid::new_v4().to_string();
    info!("client {} connected ({})", addr, conn_id);

    let mut session = Session {
        conn_id,
        outbox: tx.clone(),
        user: None,
    };
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("client {} closed", addr);
                break;
            }
            Ok(_) => {
                if let Some(reply) = process_line(&node, &mut session, &line).await {
                    if session.outbox.send(reply).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("read error from {}: {}", addr, e);
                let _ = tx.send(envelope::TRANSPORT_ERROR.to_string());
                break;
            }
        }
    }

    // Whatever ended the session, run the logout flow so no cluster entries
    // outlive the connection.
    if let Some(user) = session.user.take() {
        dispatch::logout(&node, &user).await;
    }

    drop(tx);
    drop(session);
    let _ = writer.await;
    info!("client {} session ended", addr);
}

async fn process_line(
    node: &Arc<Node>,
    session: &mut Session,
    line: &str,
) -> Option<String> {
    let cmd = match protocol::parse(line) {
        Some(cmd) => cmd,
        None => return Some(envelope::UNKNOWN_COMMAND.to_string()),
    };

    if session.user.is_none() && !cmd.allowed_before_login() {
        return Some(envelope::NOT_LOGGED_IN.to_string());
    }

    dispatch::handle(node, session, cmd).await
}
