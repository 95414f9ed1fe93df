//! Invitation reconciliation for private rooms.
//!
//! Eligible users (moderators of the governing room plus the explicit
//! invitee list) must hold a live membership; users whose pending invitation
//! lost its justification get it withdrawn. Each send is individually
//! fault-tolerant: one failed invite never aborts the pass.

use std::collections::HashMap;

use concierge_core::{Result, RoomId, UserId};
use concierge_gateway::types::membership;
use concierge_gateway::Gateway;
use serde_json::Value;
use tracing::{info, warn};

fn membership_of(members: &HashMap<String, Value>, user: &UserId) -> Option<String> {
    members
        .get(user.as_str())?
        .get("membership")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Whether a user with this membership needs a (re)invitation.
fn needs_invite(current: Option<&str>) -> bool {
    // Absent or left: invite. A previously issued invitation that was left
    // is reissued the same way.
    !matches!(
        current,
        Some(membership::JOIN | membership::INVITE | membership::BAN)
    )
}

/// Converge a private room's invitations onto the eligible set. Returns
/// the users an invitation was (re)issued to.
pub async fn reconcile_invitations(
    gateway: &Gateway,
    steward: &UserId,
    room: &RoomId,
    eligible: &[UserId],
) -> Result<Vec<UserId>> {
    let members = gateway.members(room).await?;

    let mut invited = Vec::new();
    for user in eligible {
        if user == steward {
            continue;
        }
        let current = membership_of(&members, user);
        if needs_invite(current.as_deref()) {
            info!(room = %room, user = %user, "inviting");
            match gateway.invite(room, user).await {
                Ok(()) => invited.push(user.clone()),
                Err(e) => warn!(room = %room, user = %user, error = %e, "invite failed"),
            }
        }
    }

    // Withdraw pending invitations that lost their justification. Joined
    // members are left alone.
    for (user, content) in &members {
        let user = UserId::new(user.clone());
        if user == *steward || eligible.contains(&user) {
            continue;
        }
        let current = content.get("membership").and_then(Value::as_str);
        if current == Some(membership::INVITE) {
            info!(room = %room, user = %user, "withdrawing invitation");
            if let Err(e) = gateway
                .kick(room, &user, "no longer eligible for this room")
                .await
            {
                warn!(room = %room, user = %user, error = %e, "withdrawal failed");
            }
        }
    }
    Ok(invited)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_left_users_need_invites() {
        assert!(needs_invite(None));
        assert!(needs_invite(Some(membership::LEAVE)));
    }

    #[test]
    fn live_memberships_do_not() {
        assert!(!needs_invite(Some(membership::JOIN)));
        assert!(!needs_invite(Some(membership::INVITE)));
        assert!(!needs_invite(Some(membership::BAN)));
    }
}
