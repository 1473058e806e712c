//! Per-partner conversation state.
//!
//! [`ConversationState`] keeps a conversation-indexed map so a single new
//! message or viewed flag is applied as a delta instead of recomputing
//! everything. [`ConversationStore`] puts it behind one mutex: every
//! operation is a single critical section, so an unread increment from an
//! inbound message and a decrement from a mark-viewed never interleave.
//!
//! Refetched history is authoritative. After [`ConversationState::apply_snapshot`]
//! each partner carries a watermark (the newest timestamp in the snapshot)
//! and live deltas at or before it are ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use tandem_shared::{MessageId, UserId};

/// A decrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub viewed: bool,
}

impl Message {
    /// The other member of the conversation, as seen by `local`.
    pub fn partner(&self, local: &UserId) -> &UserId {
        if &self.sender_id == local {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }

    pub fn involves(&self, local: &UserId) -> bool {
        &self.sender_id == local || &self.recipient_id == local
    }

    /// Sent by the partner to us.
    fn is_inbound(&self, local: &UserId) -> bool {
        &self.recipient_id == local && &self.sender_id != local
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub partner_id: UserId,
    pub last_message: String,
    pub last_message_id: MessageId,
    pub last_message_sender_id: UserId,
    pub timestamp_of_last: DateTime<Utc>,
    pub unread_count: usize,
    pub viewed_flag_of_last: bool,
}

/// Fold a raw message list into one summary per partner, newest first.
///
/// `messages` must be in arrival order: when two messages share a
/// timestamp the one that arrived later is the last message.
pub fn reconcile(messages: &[Message], local: &UserId) -> Vec<ConversationSummary> {
    let mut state = ConversationState::new(local.clone());
    state.apply_snapshot(messages.to_vec());
    state.summaries()
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    arrival: u64,
    /// Came from a live event rather than refetched history.
    live: bool,
}

#[derive(Debug, Default, Clone)]
struct Conversation {
    /// Sorted by `(timestamp, arrival)`.
    entries: Vec<Entry>,
    unread: usize,
    watermark: Option<DateTime<Utc>>,
}

impl Conversation {
    fn insert(&mut self, entry: Entry, local: &UserId) {
        if entry.message.is_inbound(local) && !entry.message.viewed {
            self.unread += 1;
        }
        let key = (entry.message.timestamp, entry.arrival);
        let pos = self
            .entries
            .partition_point(|e| (e.message.timestamp, e.arrival) <= key);
        self.entries.insert(pos, entry);
    }

    fn accepts_live(&self, timestamp: DateTime<Utc>) -> bool {
        self.watermark.map_or(true, |w| timestamp > w)
    }

    fn summary(&self, partner: &UserId, local: &UserId) -> Option<ConversationSummary> {
        let last = &self.entries.last()?.message;
        Some(ConversationSummary {
            partner_id: partner.clone(),
            last_message: last.content.clone(),
            last_message_id: last.id.clone(),
            last_message_sender_id: last.sender_id.clone(),
            timestamp_of_last: last.timestamp,
            unread_count: self.unread,
            viewed_flag_of_last: &last.sender_id == local || last.viewed,
        })
    }
}

/// Conversations of one local identity.
#[derive(Debug, Clone)]
pub struct ConversationState {
    local: UserId,
    conversations: HashMap<UserId, Conversation>,
    /// Message id -> partner.
    index: HashMap<MessageId, UserId>,
    next_arrival: u64,
}

impl ConversationState {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            conversations: HashMap::new(),
            index: HashMap::new(),
            next_arrival: 0,
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    fn arrival(&mut self) -> u64 {
        self.next_arrival += 1;
        self.next_arrival
    }

    fn insert(&mut self, message: Message, live: bool) {
        let partner = message.partner(&self.local).clone();
        let arrival = self.arrival();
        self.index.insert(message.id.clone(), partner.clone());
        self.conversations
            .entry(partner)
            .or_default()
            .insert(
                Entry {
                    message,
                    arrival,
                    live,
                },
                &self.local,
            );
    }

    /// Apply a message received live. Returns false when it was ignored:
    /// a duplicate id, a message not addressed to or from us, or one at or
    /// before the partner's snapshot watermark.
    pub fn apply_incoming(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) || !message.involves(&self.local) {
            return false;
        }
        let partner = message.partner(&self.local);
        let accepted = self
            .conversations
            .get(partner)
            .map_or(true, |c| c.accepts_live(message.timestamp));
        if !accepted {
            return false;
        }
        self.insert(message, true);
        true
    }

    /// Record a message the local user just sent. Not subject to the
    /// watermark.
    pub fn record_outgoing(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) || !message.involves(&self.local) {
            return false;
        }
        self.insert(message, true);
        true
    }

    /// Mark one message viewed. Unknown or already viewed ids are a no-op.
    /// Returns whether anything changed.
    pub fn mark_viewed(&mut self, id: &MessageId) -> bool {
        let Some(partner) = self.index.get(id) else {
            return false;
        };
        let Some(conversation) = self.conversations.get_mut(partner) else {
            return false;
        };
        let Some(entry) = conversation
            .entries
            .iter_mut()
            .find(|e| &e.message.id == id)
        else {
            return false;
        };
        if entry.message.viewed {
            return false;
        }
        entry.message.viewed = true;
        if entry.message.is_inbound(&self.local) {
            conversation.unread = conversation.unread.saturating_sub(1);
        }
        true
    }

    /// Mark every unread message from `partner` viewed, returning their ids.
    pub fn mark_conversation_viewed(&mut self, partner: &UserId) -> Vec<MessageId> {
        let Some(conversation) = self.conversations.get_mut(partner) else {
            return Vec::new();
        };
        let mut marked = Vec::new();
        for entry in conversation.entries.iter_mut() {
            if entry.message.is_inbound(&self.local) && !entry.message.viewed {
                entry.message.viewed = true;
                marked.push(entry.message.id.clone());
            }
        }
        conversation.unread = conversation.unread.saturating_sub(marked.len());
        marked
    }

    /// Replace state with refetched history, in arrival order.
    ///
    /// Live messages survive only when newer than the snapshot's last
    /// timestamp for their partner. A message viewed locally stays viewed
    /// even if the snapshot has not caught up yet.
    pub fn apply_snapshot(&mut self, messages: Vec<Message>) {
        let previous = std::mem::take(&mut self.conversations);
        self.index.clear();

        let mut viewed_before = HashSet::new();
        let mut live = Vec::new();
        for (partner, conversation) in previous {
            for entry in conversation.entries {
                if entry.message.viewed {
                    viewed_before.insert(entry.message.id.clone());
                }
                if entry.live {
                    live.push((partner.clone(), entry));
                }
            }
        }

        for mut message in messages {
            if self.index.contains_key(&message.id) || !message.involves(&self.local) {
                continue;
            }
            if viewed_before.contains(&message.id) {
                message.viewed = true;
            }
            self.insert(message, false);
        }

        for conversation in self.conversations.values_mut() {
            conversation.watermark = conversation.entries.last().map(|e| e.message.timestamp);
        }

        live.sort_by_key(|(_, entry)| entry.arrival);
        for (partner, entry) in live {
            if self.index.contains_key(&entry.message.id) {
                continue;
            }
            let keep = self
                .conversations
                .get(&partner)
                .map_or(true, |c| c.accepts_live(entry.message.timestamp));
            if keep {
                self.insert(entry.message, true);
            }
        }
    }

    /// Summaries for every partner, most recent conversation first.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .conversations
            .iter()
            .filter_map(|(partner, c)| c.summary(partner, &self.local))
            .collect();
        out.sort_by(|a, b| {
            b.timestamp_of_last
                .cmp(&a.timestamp_of_last)
                .then_with(|| a.partner_id.cmp(&b.partner_id))
        });
        out
    }

    pub fn summary(&self, partner: &UserId) -> Option<ConversationSummary> {
        self.conversations
            .get(partner)
            .and_then(|c| c.summary(partner, &self.local))
    }

    /// Messages with `partner`, oldest first.
    pub fn messages(&self, partner: &UserId) -> Vec<Message> {
        self.conversations
            .get(partner)
            .map(|c| c.entries.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn unread_total(&self) -> usize {
        self.conversations.values().map(|c| c.unread).sum()
    }
}

/// Shared, lock-guarded [`ConversationState`]. Readers get clones.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    inner: Arc<Mutex<ConversationState>>,
}

impl ConversationStore {
    pub fn new(local: UserId) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConversationState::new(local))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn apply_incoming(&self, message: Message) -> bool {
        self.lock().apply_incoming(message)
    }

    pub fn record_outgoing(&self, message: Message) -> bool {
        self.lock().record_outgoing(message)
    }

    pub fn mark_viewed(&self, id: &MessageId) -> bool {
        self.lock().mark_viewed(id)
    }

    pub fn mark_conversation_viewed(&self, partner: &UserId) -> Vec<MessageId> {
        self.lock().mark_conversation_viewed(partner)
    }

    pub fn apply_snapshot(&self, messages: Vec<Message>) {
        self.lock().apply_snapshot(messages)
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.lock().summaries()
    }

    pub fn summary(&self, partner: &UserId) -> Option<ConversationSummary> {
        self.lock().summary(partner)
    }

    pub fn messages(&self, partner: &UserId) -> Vec<Message> {
        self.lock().messages(partner)
    }

    pub fn unread_total(&self) -> usize {
        self.lock().unread_total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn msg(id: &str, from: &str, to: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            sender_id: UserId::from(from),
            recipient_id: UserId::from(to),
            content: format!("body of {id}"),
            timestamp: at(secs),
            viewed: false,
        }
    }

    fn me() -> UserId {
        UserId::from("me")
    }

    fn x() -> UserId {
        UserId::from("x")
    }

    #[test]
    fn test_unread_accounting() {
        let mut state = ConversationState::new(me());
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            assert!(state.apply_incoming(msg(id, "x", "me", i as i64)));
        }
        assert_eq!(state.summary(&x()).unwrap().unread_count, 3);

        assert!(state.mark_viewed(&MessageId::from("b")));
        assert_eq!(state.summary(&x()).unwrap().unread_count, 2);

        assert!(!state.mark_viewed(&MessageId::from("nope")));
        assert_eq!(state.summary(&x()).unwrap().unread_count, 2);
    }

    #[test]
    fn test_mark_viewed_is_idempotent() {
        let mut state = ConversationState::new(me());
        state.apply_incoming(msg("a", "x", "me", 0));
        assert!(state.mark_viewed(&MessageId::from("a")));
        assert!(!state.mark_viewed(&MessageId::from("a")));
        assert_eq!(state.summary(&x()).unwrap().unread_count, 0);
    }

    #[test]
    fn test_outgoing_does_not_count_as_unread() {
        let mut state = ConversationState::new(me());
        state.record_outgoing(msg("a", "me", "x", 0));
        let summary = state.summary(&x()).unwrap();
        assert_eq!(summary.unread_count, 0);
        assert!(summary.viewed_flag_of_last);
        assert_eq!(summary.last_message_sender_id, me());

        // Viewing our own message changes nothing on the counter.
        assert!(state.mark_viewed(&MessageId::from("a")));
        assert_eq!(state.summary(&x()).unwrap().unread_count, 0);
    }

    #[test]
    fn test_duplicate_ids_are_ignored() {
        let mut state = ConversationState::new(me());
        assert!(state.apply_incoming(msg("a", "x", "me", 0)));
        assert!(!state.apply_incoming(msg("a", "x", "me", 0)));
        assert_eq!(state.messages(&x()).len(), 1);
        assert_eq!(state.summary(&x()).unwrap().unread_count, 1);
    }

    #[test]
    fn test_foreign_messages_are_ignored() {
        let mut state = ConversationState::new(me());
        assert!(!state.apply_incoming(msg("a", "x", "y", 0)));
        assert!(state.summaries().is_empty());
    }

    #[test]
    fn test_reconcile_partitions_and_orders() {
        let messages = vec![
            msg("1", "x", "me", 10),
            msg("2", "me", "y", 30),
            msg("3", "me", "x", 20),
            msg("4", "y", "me", 5),
        ];
        let summaries = reconcile(&messages, &me());
        assert_eq!(summaries.len(), 2);

        assert_eq!(summaries[0].partner_id.as_str(), "y");
        assert_eq!(summaries[0].last_message_id.as_str(), "2");
        assert_eq!(summaries[0].unread_count, 1);
        assert!(summaries[0].viewed_flag_of_last);

        assert_eq!(summaries[1].partner_id.as_str(), "x");
        assert_eq!(summaries[1].last_message_id.as_str(), "3");
        assert_eq!(summaries[1].timestamp_of_last, at(20));
    }

    #[test]
    fn test_reconcile_ties_go_to_later_arrival() {
        let messages = vec![msg("first", "x", "me", 10), msg("second", "x", "me", 10)];
        let summaries = reconcile(&messages, &me());
        assert_eq!(summaries[0].last_message_id.as_str(), "second");

        let reversed = vec![msg("second", "x", "me", 10), msg("first", "x", "me", 10)];
        let summaries = reconcile(&reversed, &me());
        assert_eq!(summaries[0].last_message_id.as_str(), "first");
    }

    #[test]
    fn test_viewed_flag_of_last() {
        let mut viewed = msg("a", "x", "me", 0);
        viewed.viewed = true;
        let summaries = reconcile(&[viewed], &me());
        assert!(summaries[0].viewed_flag_of_last);
        assert_eq!(summaries[0].unread_count, 0);

        let summaries = reconcile(&[msg("b", "x", "me", 0)], &me());
        assert!(!summaries[0].viewed_flag_of_last);
    }

    #[test]
    fn test_out_of_order_live_message_keeps_last() {
        let mut state = ConversationState::new(me());
        state.apply_incoming(msg("new", "x", "me", 20));
        state.apply_incoming(msg("old", "x", "me", 10));
        let summary = state.summary(&x()).unwrap();
        assert_eq!(summary.last_message_id.as_str(), "new");
        let ids: Vec<_> = state
            .messages(&x())
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[test]
    fn test_snapshot_is_authoritative() {
        let mut state = ConversationState::new(me());
        state.apply_incoming(msg("live-old", "x", "me", 5));
        state.apply_incoming(msg("live-new", "x", "me", 50));

        state.apply_snapshot(vec![msg("s1", "x", "me", 10), msg("s2", "me", "x", 20)]);

        let ids: Vec<_> = state
            .messages(&x())
            .into_iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec!["s1", "s2", "live-new"]);
        assert_eq!(state.summary(&x()).unwrap().unread_count, 2);
    }

    #[test]
    fn test_live_delta_before_watermark_is_ignored() {
        let mut state = ConversationState::new(me());
        state.apply_snapshot(vec![msg("s1", "x", "me", 10)]);

        assert!(!state.apply_incoming(msg("late", "x", "me", 10)));
        assert!(!state.apply_incoming(msg("older", "x", "me", 3)));
        assert!(state.apply_incoming(msg("fresh", "x", "me", 11)));
        assert_eq!(state.summary(&x()).unwrap().unread_count, 2);

        // Partners absent from the snapshot have no watermark.
        assert!(state.apply_incoming(msg("y1", "y", "me", 1)));
    }

    #[test]
    fn test_snapshot_never_unviews() {
        let mut state = ConversationState::new(me());
        state.apply_snapshot(vec![msg("a", "x", "me", 0)]);
        state.mark_viewed(&MessageId::from("a"));

        // Server has not recorded the view yet.
        state.apply_snapshot(vec![msg("a", "x", "me", 0)]);
        assert!(state.messages(&x())[0].viewed);
        assert_eq!(state.summary(&x()).unwrap().unread_count, 0);
    }

    #[test]
    fn test_mark_conversation_viewed() {
        let mut state = ConversationState::new(me());
        state.apply_incoming(msg("a", "x", "me", 0));
        state.record_outgoing(msg("b", "me", "x", 1));
        state.apply_incoming(msg("c", "x", "me", 2));
        state.apply_incoming(msg("d", "y", "me", 3));

        let marked = state.mark_conversation_viewed(&x());
        assert_eq!(marked, vec![MessageId::from("a"), MessageId::from("c")]);
        assert_eq!(state.summary(&x()).unwrap().unread_count, 0);
        assert!(state.summary(&x()).unwrap().viewed_flag_of_last);
        assert_eq!(state.unread_total(), 1);

        assert!(state.mark_conversation_viewed(&x()).is_empty());
        assert!(state.mark_conversation_viewed(&UserId::from("nobody")).is_empty());
    }

    #[test]
    fn test_incremental_matches_full_reconcile() {
        let messages = vec![
            msg("1", "x", "me", 1),
            msg("2", "me", "x", 2),
            msg("3", "y", "me", 2),
            msg("4", "x", "me", 3),
            msg("5", "y", "me", 3),
        ];
        let mut state = ConversationState::new(me());
        for m in messages.clone() {
            state.apply_incoming(m);
        }
        assert_eq!(state.summaries(), reconcile(&messages, &me()));
    }

    #[tokio::test]
    async fn test_store_serialises_concurrent_updates() {
        let store = ConversationStore::new(me());
        let mut tasks = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("m{i}");
                store.apply_incoming(msg(&id, "x", "me", i));
                if i % 2 == 0 {
                    store.mark_viewed(&MessageId::from(id.as_str()));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.summary(&x()).unwrap().unread_count, 25);
        assert_eq!(store.messages(&x()).len(), 50);
    }
}
