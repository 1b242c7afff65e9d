//! Normalization boundary between wire payloads and client state.
//!
//! Snapshot responses and live events disagree on participant shape (nested
//! `personal` records vs flattened name fields vs bare ids). Every payload
//! passes through exactly one of these functions before it enters
//! [`ChatState`](crate::reconciler::ChatState), so nothing downstream ever
//! branches on where a record came from.

use chrono::DateTime;
use shared::domain::{
    Community, CommunitySummary, Conversation, ConversationKind, DeliveryStatus, Invitation,
    JoinRequest, Message, Participant, Role, Sender, UserId,
};
use shared::protocol::{
    CommunityPayload, ConversationPayload, InvitationPayload, JoinRequestPayload, MessagePayload,
    UserField, UserRef,
};

const UNKNOWN_USER: &str = "Unknown User";

pub fn display_name(user: &UserRef) -> String {
    if let Some(name) = &user.name {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Some(personal) = &user.personal {
        let full = format!("{} {}", personal.first_name, personal.last_name);
        if !full.trim().is_empty() {
            return full.trim().to_string();
        }
    }
    let flat = format!(
        "{} {}",
        user.first_name.as_deref().unwrap_or_default(),
        user.last_name.as_deref().unwrap_or_default()
    );
    if !flat.trim().is_empty() {
        return flat.trim().to_string();
    }
    UNKNOWN_USER.to_string()
}

pub fn participant(user: &UserRef) -> Participant {
    Participant {
        id: user.id.clone(),
        name: display_name(user),
    }
}

fn sender(payload: &MessagePayload) -> Sender {
    let (id, record_name, record_role) = match (&payload.sender, &payload.sender_id) {
        (Some(UserField::Record(record)), _) => (
            record.id.clone(),
            Some(display_name(record)),
            record.role,
        ),
        (Some(UserField::Id(id)), _) => (id.clone(), None, None),
        (None, Some(id)) => (id.clone(), None, None),
        (None, None) => (UserId::new(""), None, None),
    };

    let name = payload
        .sender_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or(record_name)
        .unwrap_or_else(|| UNKNOWN_USER.to_string());

    Sender {
        id,
        name,
        role: payload.sender_role.or(record_role).unwrap_or(Role::Student),
    }
}

pub fn message(payload: MessagePayload) -> Message {
    let receiver = payload
        .receiver
        .as_ref()
        .map(|r| r.id().clone())
        .or_else(|| payload.receiver_id.clone());

    Message {
        sender: sender(&payload),
        id: payload.id,
        conversation: payload.conversation,
        receiver,
        content: payload.content,
        created_at: payload.created_at,
        status: payload.status.unwrap_or(DeliveryStatus::Sent),
    }
}

pub fn conversation(payload: ConversationPayload) -> Conversation {
    Conversation {
        id: payload.id,
        kind: ConversationKind::Direct,
        name: None,
        image: None,
        participants: payload.participants.iter().map(participant).collect(),
        last_message: payload.last_message,
        last_activity: payload
            .last_message_at
            .or(payload.created_at)
            .unwrap_or(DateTime::UNIX_EPOCH),
        messages: Vec::new(),
    }
}

/// Projects a community onto the conversation list; the community id doubles
/// as the conversation id.
pub fn community_conversation(payload: &CommunityPayload) -> Conversation {
    Conversation {
        id: payload.id.as_conversation(),
        kind: ConversationKind::Community,
        name: Some(payload.name.clone()),
        image: payload.image.clone(),
        participants: payload.members.iter().map(participant).collect(),
        last_message: None,
        last_activity: payload
            .last_message_at
            .or(payload.created_at)
            .unwrap_or(DateTime::UNIX_EPOCH),
        messages: Vec::new(),
    }
}

pub fn community_summary(payload: &CommunityPayload) -> CommunitySummary {
    CommunitySummary {
        id: payload.id.clone(),
        name: payload.name.clone(),
        description: payload.description.clone(),
        image: payload.image.clone(),
    }
}

pub fn community(payload: CommunityPayload) -> Community {
    let creator = payload
        .creator
        .as_ref()
        .map(participant)
        .unwrap_or_else(|| Participant {
            id: UserId::new(""),
            name: UNKNOWN_USER.to_string(),
        });

    Community {
        creator,
        admins: payload.admins.iter().map(participant).collect(),
        members: payload.members.iter().map(participant).collect(),
        created_at: payload.created_at.unwrap_or(DateTime::UNIX_EPOCH),
        id: payload.id,
        name: payload.name,
        description: payload.description,
        image: payload.image,
    }
}

pub fn invitation(payload: InvitationPayload) -> Invitation {
    Invitation {
        community: community_summary(&payload.community),
        sender: participant(&payload.sender),
        id: payload.id,
        created_at: payload.created_at,
        status: payload.status,
    }
}

pub fn join_request(payload: JoinRequestPayload) -> JoinRequest {
    JoinRequest {
        community: community_summary(&payload.community),
        user: participant(&payload.user),
        role: payload.user.role.unwrap_or(Role::Student),
        created_at: payload.created_at,
        status: payload.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::PersonalName;

    fn user_ref(id: &str) -> UserRef {
        UserRef {
            id: UserId::from(id),
            name: None,
            personal: None,
            first_name: None,
            last_name: None,
            role: None,
        }
    }

    #[test]
    fn snapshot_and_event_participant_shapes_normalize_identically() {
        let snapshot_shape = UserRef {
            personal: Some(PersonalName {
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
            }),
            ..user_ref("u1")
        };
        let event_shape = UserRef {
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            ..user_ref("u1")
        };

        assert_eq!(participant(&snapshot_shape), participant(&event_shape));
        assert_eq!(participant(&snapshot_shape).name, "Ada Lovelace");
    }

    #[test]
    fn display_name_falls_back_to_unknown() {
        assert_eq!(display_name(&user_ref("u1")), "Unknown User");
    }

    #[test]
    fn flat_name_wins_over_fallback() {
        let user = UserRef {
            name: Some("Grace Hopper".into()),
            ..user_ref("u2")
        };
        assert_eq!(display_name(&user), "Grace Hopper");
    }
}
