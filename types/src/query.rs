use crate::ids::SessionId;
use crate::message::{Message, Role};
use crate::time::Timestamp;

/// Page request against the merged (buffered + persisted) view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub session_id: SessionId,
    /// Only messages strictly older than this.
    pub before: Option<Timestamp>,
    /// Only messages strictly newer than this.
    pub after: Option<Timestamp>,
    pub role: Option<Role>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl MessageQuery {
    #[must_use]
    pub fn session(session_id: SessionId) -> Self {
        Self {
            session_id,
            before: None,
            after: None,
            role: None,
            offset: 0,
            limit: None,
        }
    }

    #[must_use]
    pub fn before(mut self, timestamp: Timestamp) -> Self {
        self.before = Some(timestamp);
        self
    }

    #[must_use]
    pub fn after(mut self, timestamp: Timestamp) -> Self {
        self.after = Some(timestamp);
        self
    }

    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        self.before.is_none_or(|before| message.timestamp < before)
            && self.after.is_none_or(|after| message.timestamp > after)
            && self.role.is_none_or(|role| message.role == role)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    /// Chronological, oldest first.
    pub items: Vec<Message>,
    /// Number of messages matching the filters before pagination.
    pub total: usize,
    pub has_more: bool,
}

impl MessagePage {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            has_more: false,
        }
    }

    /// Filter and paginate an already-sorted message list.
    #[must_use]
    pub fn paginate(sorted: Vec<Message>, query: &MessageQuery) -> Self {
        let filtered: Vec<Message> = sorted.into_iter().filter(|m| query.matches(m)).collect();
        let total = filtered.len();
        let items: Vec<Message> = filtered
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        let has_more = query.offset.saturating_add(items.len()) < total;
        Self {
            items,
            total,
            has_more,
        }
    }
}
