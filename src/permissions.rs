//! Sender authorization via the `security` aggregate
//!
//! When a message's content address differs from its envelope sender, the
//! target address must have delegated to the sender through its `security`
//! aggregate. Each authorization entry may restrict the delegation by chain,
//! channel, message types, post types or aggregate keys; an absent filter is
//! a wildcard. The same rules apply to FORGET: a delegate may forget the
//! delegator's messages within its filters.

use rusqlite::Connection;
use serde_json::Value;

use crate::db::aggregates::get_aggregate;
use crate::error::NodeError;
use crate::types::{MessageContent, MessageEnvelope, MessageType};

const SECURITY_KEY: &str = "security";

fn string_list<'a>(auth: &'a Value, key: &str) -> Option<Vec<&'a str>> {
    auth.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
}

fn matches(
    auth: &Value,
    envelope: &MessageEnvelope,
    content: &MessageContent,
) -> bool {
    if auth.get("address").and_then(Value::as_str) != Some(envelope.sender.as_str()) {
        return false;
    }

    if let Some(chain) = auth.get("chain").and_then(Value::as_str) {
        if chain != envelope.chain.as_str() {
            return false;
        }
    }

    if let Some(channels) = string_list(auth, "channels") {
        if !channels.is_empty() && !channels.contains(&envelope.channel.as_str()) {
            return false;
        }
    }

    if let Some(types) = string_list(auth, "types") {
        if !types.is_empty() && !types.contains(&envelope.message_type.as_str()) {
            return false;
        }
    }

    if envelope.message_type == MessageType::Post {
        if let (Some(post_types), MessageContent::Post(post)) =
            (string_list(auth, "post_types"), content)
        {
            if !post_types.is_empty() && !post_types.contains(&post.post_type.as_str()) {
                return false;
            }
        }
    }

    if envelope.message_type == MessageType::Aggregate {
        if let (Some(keys), MessageContent::Aggregate(aggregate)) =
            (string_list(auth, "aggregate_keys"), content)
        {
            if !keys.is_empty() && !keys.contains(&aggregate.key.as_str()) {
                return false;
            }
        }
    }

    true
}

/// True when the envelope sender may act for the content address.
pub fn check_sender_authorization(
    conn: &Connection,
    envelope: &MessageEnvelope,
    content: &MessageContent,
) -> Result<bool, NodeError> {
    let address = content.address();
    if envelope.sender == address {
        return Ok(true);
    }

    let Some(aggregate) = get_aggregate(conn, address, SECURITY_KEY)? else {
        return Ok(false);
    };

    let authorizations = aggregate
        .content
        .get("authorizations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Ok(authorizations
        .iter()
        .any(|auth| matches(auth, envelope, content)))
}
