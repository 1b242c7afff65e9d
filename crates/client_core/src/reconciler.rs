//! Merges server-pushed events into the locally cached snapshot.
//!
//! Every handler is a synchronous mutation of [`ChatState`]; the session
//! reader applies events strictly in transport order, so the reconciler
//! never reorders events relative to each other, only folds each one into
//! the current snapshot.

use std::collections::HashSet;

use shared::domain::{
    Community, CommunityId, Conversation, ConversationId, ConversationKind, Invitation,
    InvitationId, JoinRequest, Message, Participant, UserId,
};
use shared::protocol::ServerEvent;
use tracing::{debug, warn};

use crate::normalize;
use crate::ClientEvent;

/// Result of folding one message into the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// A message with this id is already present (optimistic echo or
    /// duplicate delivery); the incoming copy is discarded.
    Duplicate,
    /// No local conversation matches; the message is dropped until the
    /// conversation arrives via `new-conversation` or a snapshot reload.
    Unmatched,
}

#[derive(Debug, Clone)]
pub struct ChatState {
    user: Participant,
    /// Sorted by last activity, most recent first.
    pub conversations: Vec<Conversation>,
    /// Communities created by the current user ("my communities" view).
    pub my_communities: Vec<Community>,
    pub pending_invitations: Vec<Invitation>,
    pub pending_join_requests: Vec<JoinRequest>,
    /// Communities with a join request recently sent; the flag auto-clears
    /// after a short delay and suppresses duplicate submissions meanwhile.
    pub join_requests_sent: HashSet<CommunityId>,
}

impl ChatState {
    pub fn new(user: Participant) -> Self {
        Self {
            user,
            conversations: Vec::new(),
            my_communities: Vec::new(),
            pending_invitations: Vec::new(),
            pending_join_requests: Vec::new(),
            join_requests_sent: HashSet::new(),
        }
    }

    pub fn user(&self) -> &Participant {
        &self.user
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Folds one inbound event into the snapshot and reports what changed.
    pub fn apply(&mut self, event: ServerEvent) -> Option<ClientEvent> {
        match event {
            ServerEvent::NewMessage(payload) | ServerEvent::DirectMessage(payload) => {
                let message = normalize::message(payload);
                match self.on_new_message(message.clone()) {
                    MergeOutcome::Appended => Some(ClientEvent::MessageReceived(message)),
                    MergeOutcome::Duplicate => {
                        debug!(message_id = %message.id, "discarding message already present locally");
                        None
                    }
                    MergeOutcome::Unmatched => {
                        warn!(
                            message_id = %message.id,
                            "dropping message for conversation not yet known locally"
                        );
                        None
                    }
                }
            }
            ServerEvent::NewConversation(payload) => {
                let conversation = normalize::conversation(payload);
                self.on_new_conversation(conversation.clone())
                    .then_some(ClientEvent::ConversationAdded(conversation))
            }
            ServerEvent::NewInvitation(payload) => {
                let invitation = normalize::invitation(payload);
                self.on_new_invitation(invitation.clone());
                Some(ClientEvent::InvitationReceived(invitation))
            }
            ServerEvent::JoinRequestReceived(payload) => {
                let request = normalize::join_request(payload);
                self.on_join_request_received(request.clone());
                Some(ClientEvent::JoinRequestReceived(request))
            }
            ServerEvent::InvitationSent(ack) => Some(ClientEvent::InvitationDelivered {
                recipient: ack.recipient,
            }),
        }
    }

    /// Append-only merge: the message lands at the end of its conversation's
    /// list, the conversation's activity is bumped, and the conversation list
    /// is re-sorted so the most recently active entry surfaces first.
    pub fn on_new_message(&mut self, message: Message) -> MergeOutcome {
        let Some(conversation_id) = self.resolve_conversation(&message) else {
            return MergeOutcome::Unmatched;
        };
        let Some(entry) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        else {
            return MergeOutcome::Unmatched;
        };

        if entry.messages.iter().any(|m| m.id == message.id) {
            return MergeOutcome::Duplicate;
        }

        entry.last_message = Some(message.content.clone());
        if message.created_at > entry.last_activity {
            entry.last_activity = message.created_at;
        }
        entry.messages.push(message);
        self.resort();
        MergeOutcome::Appended
    }

    /// Idempotent insert: a conversation id already present wins over the
    /// incoming duplicate.
    pub fn on_new_conversation(&mut self, conversation: Conversation) -> bool {
        if self.conversations.iter().any(|c| c.id == conversation.id) {
            return false;
        }
        self.conversations.push(conversation);
        self.resort();
        true
    }

    /// No business-key dedup here: duplicate suppression is the server's
    /// responsibility, and removal always filters by exact identifier.
    pub fn on_new_invitation(&mut self, invitation: Invitation) {
        self.pending_invitations.push(invitation);
    }

    pub fn on_join_request_received(&mut self, request: JoinRequest) {
        self.pending_join_requests.push(request);
    }

    pub fn remove_invitation(&mut self, id: &InvitationId) -> Option<Invitation> {
        let index = self.pending_invitations.iter().position(|i| &i.id == id)?;
        Some(self.pending_invitations.remove(index))
    }

    /// Removal is keyed by the (community, user) pair: the same user may have
    /// pending requests against several communities at once.
    pub fn remove_join_request(
        &mut self,
        community: &CommunityId,
        user: &UserId,
    ) -> Option<JoinRequest> {
        let index = self
            .pending_join_requests
            .iter()
            .position(|r| r.matches(community, user))?;
        Some(self.pending_join_requests.remove(index))
    }

    /// Installs the snapshot slice for conversations, carrying over message
    /// lists already fetched for conversations that survive the reload.
    pub fn install_conversations(
        &mut self,
        mut conversations: Vec<Conversation>,
        my_communities: Vec<Community>,
    ) {
        for conversation in &mut conversations {
            if let Some(existing) = self.conversation(&conversation.id) {
                if conversation.messages.is_empty() && !existing.messages.is_empty() {
                    conversation.messages = existing.messages.clone();
                }
            }
        }
        self.conversations = conversations;
        self.my_communities = my_communities;
        self.resort();
    }

    /// Replaces a conversation's history with the server-fetched list. The
    /// server's order is authoritative; later events append behind it.
    pub fn install_messages(&mut self, id: &ConversationId, messages: Vec<Message>) {
        let Some(entry) = self.conversations.iter_mut().find(|c| &c.id == id) else {
            return;
        };
        if let Some(last) = messages.last() {
            entry.last_message = Some(last.content.clone());
            if last.created_at > entry.last_activity {
                entry.last_activity = last.created_at;
            }
        }
        entry.messages = messages;
        self.resort();
    }

    /// Upserts a community (after create, accept, or a detail refetch) into
    /// both the "my communities" view and the conversation list.
    pub fn upsert_community(&mut self, community: Community, conversation: Conversation) {
        if community.is_creator(&self.user.id) {
            match self
                .my_communities
                .iter_mut()
                .find(|c| c.id == community.id)
            {
                Some(existing) => *existing = community,
                None => self.my_communities.insert(0, community),
            }
        }
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => {
                let messages = std::mem::take(&mut existing.messages);
                *existing = conversation;
                existing.messages = messages;
            }
            None => self.conversations.push(conversation),
        }
        self.resort();
    }

    pub fn join_request_marked_sent(&self, community: &CommunityId) -> bool {
        self.join_requests_sent.contains(community)
    }

    pub fn mark_join_request_sent(&mut self, community: CommunityId) {
        self.join_requests_sent.insert(community);
    }

    pub fn clear_join_request_sent(&mut self, community: &CommunityId) {
        self.join_requests_sent.remove(community);
    }

    fn resolve_conversation(&self, message: &Message) -> Option<ConversationId> {
        if let Some(id) = &message.conversation {
            return Some(id.clone());
        }
        // Direct-message events omit the conversation field; key by the
        // counterpart the way the history endpoint does.
        let other = if message.sender.id == self.user.id {
            message.receiver.clone()?
        } else {
            message.sender.id.clone()
        };
        self.conversations
            .iter()
            .find(|c| {
                c.kind == ConversationKind::Direct && c.participants.iter().any(|p| p.id == other)
            })
            .map(|c| c.id.clone())
    }

    fn resort(&mut self) {
        // Stable sort keeps the relative order of equally active entries.
        self.conversations
            .sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    }
}
