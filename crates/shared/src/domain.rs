use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(CommunityId);
id_newtype!(MessageId);
id_newtype!(InvitationId);

impl CommunityId {
    /// A community doubles as the conversation its messages are posted into;
    /// the backend uses the same object id for both.
    pub fn as_conversation(&self) -> ConversationId {
        ConversationId(self.0.clone())
    }
}

/// Role of the authenticated identity. The backend is inconsistent about
/// casing ("student" in tokens, "Student" in join-request bodies), so both
/// spellings deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "Admin")]
    Admin,
    #[serde(alias = "Teacher")]
    Teacher,
    #[serde(alias = "Student")]
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    /// Capitalized form expected by the membership endpoints.
    pub fn as_user_type(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Teacher => "Teacher",
            Role::Student => "Student",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Community,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Normalized participant record. Snapshot and event payloads carry
/// participants in different shapes; everything is converted to this one
/// before it enters client state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Conversation the message belongs to. Direct-message events omit the
    /// field; the reconciler resolves those through the participant pair.
    pub conversation: Option<ConversationId>,
    pub sender: Sender,
    pub receiver: Option<UserId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Community name; direct conversations are unnamed.
    pub name: Option<String>,
    pub image: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// The one participant that is not `user`. Direct sends are rejected
    /// locally when this resolves to nothing.
    pub fn other_participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id != user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunitySummary {
    pub id: CommunityId,
    pub name: String,
    pub description: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityId,
    pub name: String,
    pub description: String,
    pub image: Option<String>,
    pub creator: Participant,
    pub admins: Vec<Participant>,
    pub members: Vec<Participant>,
    pub created_at: DateTime<Utc>,
}

impl Community {
    pub fn is_creator(&self, user: &UserId) -> bool {
        &self.creator.id == user
    }

    /// The creator is implicitly an admin.
    pub fn is_admin(&self, user: &UserId) -> bool {
        self.is_creator(user) || self.admins.iter().any(|a| &a.id == user)
    }

    /// Admins are a subset of members, but the check covers all three lists
    /// because backend responses do not always uphold the invariant.
    pub fn is_member(&self, user: &UserId) -> bool {
        self.is_admin(user) || self.members.iter().any(|m| &m.id == user)
    }

    pub fn summary(&self) -> CommunitySummary {
        CommunitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            image: self.image.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub community: CommunitySummary,
    pub sender: Participant,
    pub created_at: DateTime<Utc>,
    pub status: RequestStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub community: CommunitySummary,
    pub user: Participant,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl JoinRequest {
    /// Join requests have no identifier of their own; the (community, user)
    /// pair is the key for accept/reject and local removal.
    pub fn matches(&self, community: &CommunityId, user: &UserId) -> bool {
        &self.community.id == community && &self.user.id == user
    }
}
