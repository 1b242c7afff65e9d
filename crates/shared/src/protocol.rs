use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CommunityId, ConversationId, DeliveryStatus, InvitationId, MessageId, RequestStatus, Role,
    UserId,
};

fn pending() -> RequestStatus {
    RequestStatus::Pending
}

/// Raw user record as the backend serializes it. Depending on the endpoint
/// the display name arrives as a flat `name`, a nested `personal` object, or
/// flattened `firstName`/`lastName` fields; the client normalizes all three.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal: Option<PersonalName>,
    #[serde(default, rename = "firstName", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, rename = "lastName", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalName {
    #[serde(default, rename = "firstName")]
    pub first_name: String,
    #[serde(default, rename = "lastName")]
    pub last_name: String,
}

/// Some payloads reference a user by bare id, others embed a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserField {
    Id(UserId),
    Record(UserRef),
}

impl UserField {
    pub fn id(&self) -> &UserId {
        match self {
            UserField::Id(id) => id,
            UserField::Record(record) => &record.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationId>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserField>,
    #[serde(default, rename = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, rename = "senderType", skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<Role>,
    #[serde(default, rename = "senderName", skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<UserField>,
    #[serde(default, rename = "receiverId", skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(rename = "createdAt", alias = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    #[serde(default)]
    pub participants: Vec<UserRef>,
    #[serde(default, rename = "lastMessage", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, rename = "lastMessageAt", skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityPayload {
    #[serde(rename = "_id")]
    pub id: CommunityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<UserRef>,
    #[serde(default)]
    pub admins: Vec<UserRef>,
    #[serde(default)]
    pub members: Vec<UserRef>,
    #[serde(default, rename = "lastMessageAt", skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationPayload {
    #[serde(rename = "_id")]
    pub id: InvitationId,
    pub community: CommunityPayload,
    pub sender: UserRef,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "pending")]
    pub status: RequestStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequestPayload {
    pub community: CommunityPayload,
    pub user: UserRef,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "pending")]
    pub status: RequestStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationAck {
    pub recipient: UserId,
}

/// Events pushed by the server over the live session, in transport order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(MessagePayload),
    DirectMessage(MessagePayload),
    NewConversation(ConversationPayload),
    NewInvitation(InvitationPayload),
    JoinRequestReceived(JoinRequestPayload),
    InvitationSent(InvitationAck),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestUser {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: String,
}

/// Signals the client emits over the live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientSignal {
    Authenticate {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    InvitationSent {
        recipient: UserId,
    },
    JoinRequestSent {
        #[serde(rename = "communityId")]
        community_id: CommunityId,
        user: RequestUser,
    },
}

// ---- REST request/response bodies ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDirectMessageRequest {
    #[serde(rename = "receiverId")]
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCommunityMessageRequest {
    pub content: String,
    pub sender: UserId,
    #[serde(rename = "senderType")]
    pub sender_role: Role,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    pub conversation: ConversationId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendInvitationRequest {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(rename = "senderType")]
    pub sender_role: Role,
    #[serde(rename = "senderName")]
    pub sender_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequestBody {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(rename = "userType")]
    pub user_type: String,
    pub user: RequestUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationParticipant {
    #[serde(rename = "participantId")]
    pub participant_id: UserId,
    #[serde(rename = "participantType")]
    pub participant_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub participants: Vec<ConversationParticipant>,
}

/// Some listing endpoints wrap their result in a `data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCommunityResponse {
    pub community: CommunityPayload,
}

/// Error body shape used by the REST backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
