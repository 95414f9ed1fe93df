//! Lazy, restartable history pagination.
//!
//! Each page request carries a continuation cursor; the sequence ends when
//! the server returns none. Consumers may stop early without exhausting
//! remote history.

use concierge_core::{Result, RoomId};
use serde_json::Value;

use crate::gateway::Gateway;
use crate::types::{MessagesPage, RoomEvent};

/// Direction of history traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Newest first.
    Backward,
    /// Oldest first.
    Forward,
}

impl Direction {
    fn wire(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// Cursor over one room's message history.
///
/// Created by [`Gateway::messages`]. Pages are fetched on demand with
/// [`next_page`](MessagePager::next_page).
pub struct MessagePager<'a> {
    gateway: &'a Gateway,
    room: RoomId,
    direction: Direction,
    filter: Option<Value>,
    cursor: Option<String>,
    exhausted: bool,
}

impl<'a> MessagePager<'a> {
    pub(crate) fn new(
        gateway: &'a Gateway,
        room: RoomId,
        direction: Direction,
        filter: Option<Value>,
    ) -> Self {
        Self {
            gateway,
            room,
            direction,
            filter,
            cursor: None,
            exhausted: false,
        }
    }

    /// Fetch the next page of events. Returns `None` once the server has no
    /// further history in this direction.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RoomEvent>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page: MessagesPage = self
            .gateway
            .fetch_messages(
                &self.room,
                self.direction.wire(),
                self.cursor.as_deref(),
                self.filter.as_ref(),
            )
            .await?;

        match page.end {
            Some(end) => self.cursor = Some(end),
            None => self.exhausted = true,
        }
        if page.chunk.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page.chunk))
    }
}
