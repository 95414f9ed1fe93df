//! Space child-membership reconciliation.
//!
//! A space's children are diffed against the freshly reconciled expected
//! set: absent children are unlinked, and each expected child's membership
//! record is upserted field by field, writing only when something differs.

use std::collections::HashMap;

use concierge_core::{Result, RoomId, StateRef};
use concierge_gateway::types::event_type;
use concierge_gateway::Gateway;
use serde_json::json;
use tracing::{debug, info};

use crate::types::{ChildRecord, ListedSpace, Room};

/// A child the plan expects a space to list.
#[derive(Debug, Clone)]
pub struct ExpectedChild {
    /// The reconciled child room.
    pub room: Room,
    /// Promoted visibility within the space.
    pub suggested: bool,
}

impl ExpectedChild {
    fn record(&self) -> ChildRecord {
        ChildRecord {
            order: Some(self.room.sort_key.clone()),
            suggested: self.suggested,
        }
    }
}

/// Fetch a space's current child membership snapshot.
pub async fn load_space(gateway: &Gateway, room: Room, private: bool) -> Result<ListedSpace> {
    let children = gateway
        .room_state_of_type(&room.id, event_type::SPACE_CHILD)
        .await?
        .into_iter()
        .filter_map(|(child_id, content)| {
            ChildRecord::from_content(&content).map(|record| (RoomId::new(child_id), record))
        })
        .collect();
    Ok(ListedSpace {
        room,
        private,
        children,
    })
}

/// Which fields of a membership record need updating.
fn changed_fields(actual: Option<&ChildRecord>, desired: &ChildRecord) -> Vec<&'static str> {
    let Some(actual) = actual else {
        return vec!["order", "suggested"];
    };
    let mut fields = Vec::new();
    if actual.order != desired.order {
        fields.push("order");
    }
    if actual.suggested != desired.suggested {
        fields.push("suggested");
    }
    fields
}

/// Converge a space's child list onto the expected set.
///
/// The public-parent index maps each publicly listed child to its space;
/// children of a private space are kept out of it.
pub async fn reconcile_space_children(
    gateway: &Gateway,
    space: &mut ListedSpace,
    expected: &[ExpectedChild],
    server_name: &str,
    public_parents: &mut HashMap<RoomId, RoomId>,
) -> Result<()> {
    let stale: Vec<RoomId> = space
        .children
        .keys()
        .filter(|child| !expected.iter().any(|e| &e.room.id == *child))
        .cloned()
        .collect();

    for child in stale {
        info!(space = %space.room.id, child = %child, "unlinking space child");
        gateway
            .send_state(
                &space.room.id,
                &StateRef::keyed(event_type::SPACE_CHILD, child.as_str()),
                json!({}),
            )
            .await?;
        space.children.remove(&child);
        if public_parents.get(&child) == Some(&space.room.id) {
            public_parents.remove(&child);
        }
    }

    for child in expected {
        let desired = child.record();
        let fields = changed_fields(space.children.get(&child.room.id), &desired);
        if !fields.is_empty() {
            debug!(
                space = %space.room.id,
                child = %child.room.id,
                fields = ?fields,
                "updating space child membership"
            );
            gateway
                .send_state(
                    &space.room.id,
                    &StateRef::keyed(event_type::SPACE_CHILD, child.room.id.as_str()),
                    desired.render(server_name),
                )
                .await?;
            space.children.insert(child.room.id.clone(), desired);
        }
        if space.private {
            public_parents.remove(&child.room.id);
        } else {
            public_parents.insert(child.room.id.clone(), space.room.id.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_record_needs_all_fields() {
        let desired = ChildRecord {
            order: Some("0010".into()),
            suggested: false,
        };
        assert_eq!(changed_fields(None, &desired), vec!["order", "suggested"]);
    }

    #[test]
    fn matching_record_needs_nothing() {
        let record = ChildRecord {
            order: Some("0010".into()),
            suggested: true,
        };
        assert!(changed_fields(Some(&record), &record).is_empty());
    }

    #[test]
    fn single_field_drift_is_isolated() {
        let actual = ChildRecord {
            order: Some("0010".into()),
            suggested: false,
        };
        let desired = ChildRecord {
            order: Some("0010".into()),
            suggested: true,
        };
        assert_eq!(changed_fields(Some(&actual), &desired), vec!["suggested"]);
    }
}
