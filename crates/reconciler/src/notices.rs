//! Managed notices.
//!
//! Redirect and intro texts are posted as notice messages carrying a
//! marker, and updated by edit rather than reposted. The existing notice is
//! found by scanning recent history; its replace chain is followed to the
//! root message so edits always target the original event.

use std::collections::HashMap;

use concierge_core::{Error, Result, RoomId, UserId};
use concierge_gateway::{Direction, Gateway};
use concierge_gateway::types::RoomEvent;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Content key marking a message as a managed notice.
pub const NOTICE_MARKER: &str = "org.concierge.notice";

/// Bound on replace-chain traversal. A remote system should never produce a
/// cyclic chain, but nothing enforces that, so the walk is bounded.
pub const MAX_REPLACE_DEPTH: usize = 16;

/// Which managed notice a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Pinned introduction text.
    Intro,
    /// Pointer to another room.
    Redirect,
}

impl NoticeKind {
    /// The marker value in message content.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intro => "intro",
            Self::Redirect => "redirect",
        }
    }
}

/// The text a message currently displays: the edited content if the event
/// is an edit, the plain body otherwise.
fn effective_body(content: &Value) -> Option<&str> {
    content
        .get("m.new_content")
        .unwrap_or(content)
        .get("body")
        .and_then(Value::as_str)
}

fn replace_target(content: &Value) -> Option<&str> {
    let relates = content.get("m.relates_to")?;
    if relates.get("rel_type")?.as_str()? != "m.replace" {
        return None;
    }
    relates.get("event_id")?.as_str()
}

/// The surviving state of a managed notice: its root event and the text it
/// currently displays after all edits.
#[derive(Debug)]
pub struct NoticeState {
    /// Event id edits must target.
    pub root_id: String,
    /// Currently displayed text.
    pub body: String,
}

/// Resolve the notice of `kind` from a newest-first event window.
///
/// The newest marker event wins; its replace chain is followed to the root
/// within the window, bounded by [`MAX_REPLACE_DEPTH`].
pub fn resolve_notice(events: &[RoomEvent], kind: NoticeKind) -> Result<Option<NoticeState>> {
    let by_id: HashMap<&str, &RoomEvent> = events
        .iter()
        .map(|event| (event.event_id.as_str(), event))
        .collect();

    let Some(newest) = events.iter().find(|event| {
        event.content.get(NOTICE_MARKER).and_then(Value::as_str) == Some(kind.as_str())
    }) else {
        return Ok(None);
    };

    let body = effective_body(&newest.content).unwrap_or_default().to_string();

    let mut current = newest;
    for _ in 0..MAX_REPLACE_DEPTH {
        match replace_target(&current.content) {
            None => {
                return Ok(Some(NoticeState {
                    root_id: current.event_id.clone(),
                    body,
                }))
            }
            Some(target) => match by_id.get(target) {
                Some(parent) => current = parent,
                None => {
                    // Root fell outside the window; the target id is still
                    // the right thing to edit.
                    return Ok(Some(NoticeState {
                        root_id: target.to_string(),
                        body,
                    }));
                }
            },
        }
    }
    Err(Error::assertion(format!(
        "notice replace chain exceeds {MAX_REPLACE_DEPTH} hops"
    )))
}

/// Ensure the room displays exactly `body` as its notice of `kind`.
///
/// Posts a fresh notice when none exists, edits the existing root when the
/// text changed, does nothing when it already matches. Returns the root
/// event id of the notice.
pub async fn upsert_notice(
    gateway: &Gateway,
    steward: &UserId,
    room: &RoomId,
    kind: NoticeKind,
    body: &str,
) -> Result<String> {
    let existing = find_notice(gateway, steward, room, kind).await?;

    match existing {
        None => {
            debug!(room = %room, kind = kind.as_str(), "posting notice");
            gateway
                .send_message(
                    room,
                    json!({
                        "msgtype": "m.notice",
                        "body": body,
                        NOTICE_MARKER: kind.as_str(),
                    }),
                )
                .await
        }
        Some(state) if state.body == body => Ok(state.root_id),
        Some(state) => {
            debug!(room = %room, kind = kind.as_str(), "editing notice");
            gateway
                .send_message(
                    room,
                    json!({
                        "msgtype": "m.notice",
                        "body": format!("* {body}"),
                        NOTICE_MARKER: kind.as_str(),
                        "m.new_content": {
                            "msgtype": "m.notice",
                            "body": body,
                            NOTICE_MARKER: kind.as_str(),
                        },
                        "m.relates_to": {
                            "rel_type": "m.replace",
                            "event_id": state.root_id,
                        },
                    }),
                )
                .await?;
            Ok(state.root_id)
        }
    }
}

/// Scan recent history for the managed notice of `kind`.
async fn find_notice(
    gateway: &Gateway,
    steward: &UserId,
    room: &RoomId,
    kind: NoticeKind,
) -> Result<Option<NoticeState>> {
    let filter = json!({
        "types": ["m.room.message"],
        "senders": [steward],
    });
    let mut pager = gateway.messages(room.clone(), Direction::Backward, Some(filter));

    let mut window: Vec<RoomEvent> = Vec::new();
    while let Some(page) = pager.next_page().await? {
        window.extend(page);
        // Stop paging once the window can resolve a full chain: a marker
        // event exists and its chain bottoms out inside the window.
        match resolve_notice(&window, kind) {
            Ok(found @ Some(_)) => return Ok(found),
            Ok(None) => {}
            Err(e) => {
                warn!(room = %room, error = %e, "unresolvable notice chain");
                return Err(e);
            }
        }
    }
    Ok(None)
}
