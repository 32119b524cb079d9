//! Broadcast fanout
//!
//! Delivers one line to every member snapshot in a list. Recipients are
//! grouped by node: local ones get the line pushed straight into their
//! connection outboxes, each remote node gets a single delivery call
//! covering all of its recipients. Remote deliveries run in parallel and a
//! failed node never blocks the others.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::cluster::rpc::RemoteOp;
use crate::server::node::Node;
use crate::server::user::UserRecord;
use crate::NodeId;

/// Deliver `line` to every member's socket, across nodes
pub async fn deliver(node: &Arc<Node>, members: &[UserRecord], line: &str) {
    let mut by_node: HashMap<NodeId, Vec<String>> = HashMap::new();
    for member in members {
        by_node
            .entry(member.node.clone())
            .or_default()
            .push(member.user_number.clone());
    }

    let mut handles = Vec::new();
    for (target, user_numbers) in by_node {
        if target == *node.id() {
            node.users().deliver(&user_numbers, line).await;
            continue;
        }

        let peers = Arc::clone(node.peers());
        let line = line.to_string();
        handles.push(tokio::spawn(async move {
            if let Err(e) = peers
                .call(
                    &target,
                    RemoteOp::DeliverLines {
                        user_numbers,
                        line,
                    },
                )
                .await
            {
                warn!("delivery to {} failed: {}", target, e);
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}
