//! src/conversations/mod.rs
//!
//! Conversation identity per session. A conversation is keyed by
//! (session, kind, case-insensitive name) and stamped with the session epoch it was
//! created under.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use parley_common::models::{
    normalize_name, Conversation, ConversationId, ConversationKind, SessionHandle,
};

type ConversationKey = (SessionHandle, ConversationKind, String);

struct Entry {
    conversation: Conversation,
    last_activity: DateTime<Utc>,
}

pub struct ConversationTable {
    entries: HashMap<ConversationKey, Entry>,
    next_id: u64,
    ttl: Option<Duration>,
}

fn key(session: SessionHandle, kind: ConversationKind, name: &str) -> ConversationKey {
    (session, kind, normalize_name(name))
}

impl ConversationTable {
    /// `ttl` of `None` keeps conversations until their session goes away.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
            ttl,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns the conversation for this name on the session's current epoch, creating it
    /// when absent or when the stored one belongs to an older epoch.
    pub fn lookup_or_create(
        &mut self,
        session: SessionHandle,
        epoch: u64,
        kind: ConversationKind,
        name: &str,
        now: DateTime<Utc>,
    ) -> Conversation {
        let k = key(session, kind, name);
        if let Some(entry) = self.entries.get_mut(&k) {
            if entry.conversation.epoch == epoch {
                entry.last_activity = now;
                return entry.conversation.clone();
            }
        }

        self.next_id += 1;
        let conversation = Conversation {
            id: ConversationId(self.next_id),
            kind,
            name: name.to_string(),
            session,
            epoch,
        };
        debug!(
            "(ConversationTable) new {} conversation '{}' on {} (epoch {})",
            kind, name, session, epoch
        );
        self.entries.insert(
            k,
            Entry {
                conversation: conversation.clone(),
                last_activity: now,
            },
        );
        conversation
    }

    pub fn get(&self, session: SessionHandle, kind: ConversationKind, name: &str) -> Option<&Conversation> {
        self.entries
            .get(&key(session, kind, name))
            .map(|e| &e.conversation)
    }

    pub fn contains(&self, conversation: &Conversation) -> bool {
        self.get(conversation.session, conversation.kind, &conversation.name)
            .is_some_and(|c| c.id == conversation.id)
    }

    /// Marks activity on a conversation. A conversation evicted for idleness comes back
    /// under its old id as long as nothing newer took its place.
    pub fn touch(&mut self, conversation: &Conversation, now: DateTime<Utc>) {
        let k = key(conversation.session, conversation.kind, &conversation.name);
        let entry = self.entries.entry(k).or_insert_with(|| Entry {
            conversation: conversation.clone(),
            last_activity: now,
        });
        if entry.conversation.id == conversation.id {
            entry.last_activity = now;
        }
    }

    /// Drops every conversation of a session. Returns how many were dropped.
    pub fn invalidate_session(&mut self, session: SessionHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(s, _, _), _| *s != session);
        before - self.entries.len()
    }

    /// Drops a session's conversations created under any epoch other than `epoch`.
    pub fn invalidate_stale(&mut self, session: SessionHandle, epoch: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(s, _, _), e| *s != session || e.conversation.epoch == epoch);
        before - self.entries.len()
    }

    /// Drops conversations idle for longer than the TTL.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, e| now - e.last_activity <= ttl);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("(ConversationTable) evicted {} idle conversation(s)", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
