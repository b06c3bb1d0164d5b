//! Outbox append.
//!
//! One event row per state change, inserted through the caller's open
//! session so it shares the caller's atomicity. This module never opens a
//! scope of its own: if the caller rolls back, the event row vanishes with
//! the mutation it described.

use usr_common::{EventPayload, OutboxEvent, Result};
use uuid::Uuid;

use crate::StoreTx;

/// Serialize `payload`, mint a fresh event id, and insert the row through
/// `tx`. Serialization and storage failures propagate to the caller, who
/// must roll back.
pub async fn append(
    tx: &mut dyn StoreTx,
    user_id: Uuid,
    payload: &EventPayload,
) -> Result<Uuid> {
    let data = serde_json::to_value(payload)?;
    let event = OutboxEvent::new(user_id, payload.kind(), data);
    tx.insert_event(&event).await?;
    Ok(event.id)
}
