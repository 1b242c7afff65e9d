//! Client core for the campus messaging and notification feature: one live
//! session per identity, REST snapshot loading, event reconciliation, and
//! the community membership workflows built on top of both.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use shared::domain::{
    Community, CommunityId, Conversation, ConversationId, ConversationKind, Invitation,
    InvitationId, JoinRequest, Message, Participant, Role, UserId,
};
use shared::error::ErrorCode;
use shared::protocol::{
    ClientSignal, CommunityPayload, ConversationParticipant, ConversationPayload,
    CreateCommunityResponse, CreateConversationRequest, DataEnvelope, InvitationPayload,
    JoinRequestBody, JoinRequestPayload, MessagePayload, RequestUser, SendCommunityMessageRequest,
    SendDirectMessageRequest, SendInvitationRequest,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

pub mod error;
pub mod normalize;
pub mod reconciler;
pub mod session;

pub use error::ClientError;
pub use reconciler::{ChatState, MergeOutcome};
pub use session::{LiveSession, ReconnectPolicy, SessionConfig, SessionEvent};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the per-community "request sent" flag stays up before it clears
/// on its own, independent of server confirmation latency.
const JOIN_REQUEST_FLAG_RESET: Duration = Duration::from_secs(3);
const CLIENT_EVENT_CAPACITY: usize = 256;

/// The authenticated identity the feature is mounted for. A missing user id
/// leaves the whole messaging feature inert rather than erroring.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Option<UserId>,
    pub name: String,
    pub role: Role,
}

/// Role-scoped bearer tokens from session storage. Exactly one is expected
/// to be present at a time; selection just takes the first available.
#[derive(Debug, Clone, Default)]
pub struct RoleTokens {
    pub admin: Option<String>,
    pub teacher: Option<String>,
    pub student: Option<String>,
}

impl RoleTokens {
    pub fn bearer(&self) -> Option<&str> {
        self.admin
            .as_deref()
            .or(self.teacher.as_deref())
            .or(self.student.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub join_request_flag_reset: Duration,
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            request_timeout: REQUEST_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            join_request_flag_reset: JOIN_REQUEST_FLAG_RESET,
        }
    }
}

/// Updates fanned out to the application after the reconciler has merged
/// them into state.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    MessageReceived(Message),
    ConversationAdded(Conversation),
    InvitationReceived(Invitation),
    JoinRequestReceived(JoinRequest),
    InvitationDelivered { recipient: UserId },
}

/// Result of a send intent. Non-members posting into a community are
/// diverted into the join-request path instead of failing the send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Message),
    /// A join request was issued on the sender's behalf; the message was not
    /// delivered and is not appended anywhere.
    JoinRequested(CommunityId),
    /// A join request is already awaiting approval; nothing new was issued.
    JoinRequestPending(CommunityId),
}

/// Non-fatal failure of one snapshot slice; the other slices still loaded.
#[derive(Debug, Clone)]
pub struct SnapshotWarning {
    pub slice: &'static str,
    pub message: String,
}

impl SnapshotWarning {
    fn new(slice: &'static str, err: ClientError) -> Self {
        Self {
            slice,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCommunity {
    pub name: String,
    pub description: String,
    pub image: Option<CommunityImage>,
}

#[derive(Debug, Clone)]
pub struct CommunityImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Operations the UI layer drives, kept behind a trait so views can be
/// tested against a scripted double.
#[async_trait]
pub trait MessagingHandle: Send + Sync {
    async fn load_snapshot(&self) -> Vec<SnapshotWarning>;
    async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<SendOutcome, ClientError>;
    async fn send_invitation(
        &self,
        community: &CommunityId,
        target: &Participant,
    ) -> Result<(), ClientError>;
    async fn accept_invitation(&self, id: &InvitationId)
        -> Result<Option<Community>, ClientError>;
    async fn reject_invitation(&self, id: &InvitationId) -> Result<(), ClientError>;
    async fn request_join(&self, community: &CommunityId) -> Result<(), ClientError>;
    async fn accept_join_request(
        &self,
        community: &CommunityId,
        user: &UserId,
    ) -> Result<(), ClientError>;
    async fn reject_join_request(
        &self,
        community: &CommunityId,
        user: &UserId,
    ) -> Result<(), ClientError>;
    async fn conversations(&self) -> Vec<Conversation>;
    async fn pending_invitations(&self) -> Vec<Invitation>;
    async fn pending_join_requests(&self) -> Vec<JoinRequest>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct MessagingClient {
    http: reqwest::Client,
    config: ClientConfig,
    identity: Identity,
    tokens: RoleTokens,
    state: Arc<Mutex<ChatState>>,
    session: Mutex<Option<LiveSession>>,
    merge_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl MessagingClient {
    pub fn new(
        config: ClientConfig,
        identity: Identity,
        tokens: RoleTokens,
    ) -> Result<Arc<Self>, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ClientError::Http)?;
        let user = Participant {
            id: identity
                .user_id
                .clone()
                .unwrap_or_else(|| UserId::new("")),
            name: identity.name.clone(),
        };
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        Ok(Arc::new(Self {
            http,
            config,
            identity,
            tokens,
            state: Arc::new(Mutex::new(ChatState::new(user))),
            session: Mutex::new(None),
            merge_task: Mutex::new(None),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    // ---- live session ----

    /// Opens (or replaces) the live session. Returns `false` when the
    /// identity has no user id and the feature stays inert.
    pub async fn connect(self: &Arc<Self>) -> Result<bool, ClientError> {
        if self.identity.user_id.is_none() {
            return Ok(false);
        }
        let token = self
            .tokens
            .bearer()
            .ok_or(ClientError::Unauthenticated)?
            .to_string();
        let session_config = SessionConfig {
            server_url: self.config.api_base_url.clone(),
            reconnect: self.config.reconnect.clone(),
        };
        let Some(session) = LiveSession::connect(&self.identity, &token, session_config).await?
        else {
            return Ok(false);
        };
        let receiver = session.subscribe();

        // Exactly one active session: the previous one is torn down before
        // the new one starts delivering, so nothing is double-delivered.
        if let Some(previous) = self.session.lock().await.replace(session) {
            previous.disconnect().await;
        }
        if let Some(previous) = self
            .merge_task
            .lock()
            .await
            .replace(self.spawn_merge_task(receiver))
        {
            previous.abort();
        }

        let _ = self.events.send(ClientEvent::Connected);
        Ok(true)
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.merge_task.lock().await.take() {
            task.abort();
        }
        if let Some(session) = self.session.lock().await.take() {
            session.disconnect().await;
            let _ = self.events.send(ClientEvent::Disconnected);
        }
    }

    /// Applies session events to state strictly in delivery order, then fans
    /// the resulting updates out to subscribers.
    fn spawn_merge_task(&self, mut receiver: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(SessionEvent::Event(event)) => {
                        let update = { state.lock().await.apply(event) };
                        if let Some(update) = update {
                            let _ = events.send(update);
                        }
                    }
                    Ok(SessionEvent::Connected) => {
                        let _ = events.send(ClientEvent::Connected);
                    }
                    Ok(SessionEvent::Disconnected) => {
                        let _ = events.send(ClientEvent::Disconnected);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "client fell behind on live session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    /// Best-effort signal emit; a missing or broken session is logged and
    /// skipped, never surfaced as a failure of the triggering action.
    async fn emit_signal(&self, signal: ClientSignal) {
        let guard = self.session.lock().await;
        let Some(session) = guard.as_ref() else {
            warn!("live session not connected; skipping signal emit");
            return;
        };
        if let Err(err) = session.emit(signal).await {
            warn!(%err, "failed to emit signal over live session");
        }
    }

    // ---- snapshot loading ----

    /// Loads the three snapshot slices concurrently. A failing slice
    /// degrades to empty and is reported as a warning; it never blocks the
    /// others.
    pub async fn load_snapshot(&self) -> Vec<SnapshotWarning> {
        let (conversations, invitations, join_requests) = tokio::join!(
            self.fetch_conversation_slice(),
            self.fetch_invitation_slice(),
            self.fetch_join_request_slice(),
        );

        let mut warnings = Vec::new();
        let mut state = self.state.lock().await;

        match conversations {
            Ok((conversations, my_communities)) => {
                state.install_conversations(conversations, my_communities);
            }
            Err(err) => {
                warn!(%err, "failed to load conversations; degrading to empty");
                state.install_conversations(Vec::new(), Vec::new());
                warnings.push(SnapshotWarning::new("conversations", err));
            }
        }
        match invitations {
            Ok(invitations) => state.pending_invitations = invitations,
            Err(err) => {
                warn!(%err, "failed to load invitations; degrading to empty");
                state.pending_invitations = Vec::new();
                warnings.push(SnapshotWarning::new("invitations", err));
            }
        }
        match join_requests {
            Ok(join_requests) => state.pending_join_requests = join_requests,
            Err(err) => {
                warn!(%err, "failed to load join requests; degrading to empty");
                state.pending_join_requests = Vec::new();
                warnings.push(SnapshotWarning::new("join-requests", err));
            }
        }

        warnings
    }

    async fn fetch_conversation_slice(
        &self,
    ) -> Result<(Vec<Conversation>, Vec<Community>), ClientError> {
        let me = self.require_user()?;

        let response = self
            .request(Method::GET, "/api/messages/communities")?
            .send()
            .await
            .map_err(ClientError::http)?;
        let communities: Vec<CommunityPayload> = decode(response).await?;

        let response = self
            .request(Method::GET, "/api/messages/conversations")?
            .send()
            .await
            .map_err(ClientError::http)?;
        let direct: Vec<ConversationPayload> = decode(response).await?;

        let communities = dedupe_communities(communities);
        // Membership alone is not enough for the "my communities" view;
        // only communities the current user created belong there.
        let my_communities = communities
            .iter()
            .filter(|c| c.creator.as_ref().map(|u| u.id == me).unwrap_or(false))
            .cloned()
            .map(normalize::community)
            .collect();
        let mut conversations: Vec<Conversation> = communities
            .iter()
            .map(normalize::community_conversation)
            .collect();
        conversations.extend(direct.into_iter().map(normalize::conversation));
        Ok((conversations, my_communities))
    }

    async fn fetch_invitation_slice(&self) -> Result<Vec<Invitation>, ClientError> {
        let response = self
            .request(Method::GET, "/api/messages/invitations")?
            .send()
            .await
            .map_err(ClientError::http)?;
        let envelope: DataEnvelope<Vec<InvitationPayload>> = decode(response).await?;
        Ok(envelope.data.into_iter().map(normalize::invitation).collect())
    }

    async fn fetch_join_request_slice(&self) -> Result<Vec<JoinRequest>, ClientError> {
        let response = self
            .request(Method::GET, "/api/messages/communities/join-requests")?
            .send()
            .await
            .map_err(ClientError::http)?;
        let payloads: Vec<JoinRequestPayload> = decode(response).await?;
        Ok(payloads.into_iter().map(normalize::join_request).collect())
    }

    /// Fetches and installs the message history of one conversation; routing
    /// is by conversation kind.
    pub async fn fetch_conversation_messages(
        &self,
        id: &ConversationId,
    ) -> Result<Vec<Message>, ClientError> {
        let me = self.require_user()?;
        let (kind, counterpart) = {
            let state = self.state.lock().await;
            let Some(entry) = state.conversation(id) else {
                return Err(ClientError::UnknownConversation(id.clone()));
            };
            (entry.kind, entry.other_participant(&me).map(|p| p.id.clone()))
        };

        let path = match kind {
            ConversationKind::Community => format!("/api/messages/community/{id}"),
            ConversationKind::Direct => {
                let Some(other) = counterpart else {
                    return Err(ClientError::NoRecipient);
                };
                format!("/api/messages/direct/{other}")
            }
        };

        let response = self
            .request(Method::GET, &path)?
            .send()
            .await
            .map_err(ClientError::http)?;
        let payloads: Vec<MessagePayload> = decode(response).await?;
        let messages: Vec<Message> = payloads
            .into_iter()
            .map(normalize::message)
            .map(|mut m| {
                m.conversation.get_or_insert_with(|| id.clone());
                m
            })
            .collect();

        self.state.lock().await.install_messages(id, messages.clone());
        Ok(messages)
    }

    // ---- delivery ----

    /// Routes a send intent by conversation kind. Direct sends with no
    /// resolvable counterpart are rejected locally before any network call.
    pub async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<SendOutcome, ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let me = self.require_user()?;

        let (kind, counterpart) = {
            let state = self.state.lock().await;
            let Some(entry) = state.conversation(conversation) else {
                return Err(ClientError::UnknownConversation(conversation.clone()));
            };
            (entry.kind, entry.other_participant(&me).map(|p| p.id.clone()))
        };

        match kind {
            ConversationKind::Direct => {
                let Some(receiver) = counterpart else {
                    return Err(ClientError::NoRecipient);
                };
                self.send_direct(conversation, receiver, content).await
            }
            ConversationKind::Community => {
                self.send_community(&CommunityId::new(conversation.as_str()), content)
                    .await
            }
        }
    }

    async fn send_direct(
        &self,
        conversation: &ConversationId,
        receiver: UserId,
        content: &str,
    ) -> Result<SendOutcome, ClientError> {
        let response = self
            .request(Method::POST, "/api/messages/direct")?
            .json(&SendDirectMessageRequest {
                receiver_id: receiver,
                content: content.to_string(),
            })
            .send()
            .await
            .map_err(ClientError::http)?;
        let payload: MessagePayload = decode(response).await?;
        Ok(SendOutcome::Sent(
            self.append_sent_message(conversation, payload).await,
        ))
    }

    async fn send_community(
        &self,
        community_id: &CommunityId,
        content: &str,
    ) -> Result<SendOutcome, ClientError> {
        let me = self.require_user()?;
        let community = normalize::community(self.fetch_community_payload(community_id).await?);

        if !community.is_member(&me) {
            // Divert into the join-request path instead of failing the send.
            if self
                .state
                .lock()
                .await
                .join_request_marked_sent(community_id)
            {
                return Ok(SendOutcome::JoinRequestPending(community_id.clone()));
            }
            return match self.request_join(community_id).await {
                Ok(()) => Ok(SendOutcome::JoinRequested(community_id.clone())),
                Err(ClientError::JoinRequestPending) => {
                    Ok(SendOutcome::JoinRequestPending(community_id.clone()))
                }
                Err(err) => Err(err),
            };
        }

        let body = SendCommunityMessageRequest {
            content: content.to_string(),
            sender: me.clone(),
            sender_role: self.identity.role,
            sender_name: self.identity.name.clone(),
            conversation: community_id.as_conversation(),
            timestamp: Utc::now(),
            is_admin: community.is_admin(&me),
        };
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/community/{community_id}"),
            )?
            .json(&body)
            .send()
            .await
            .map_err(ClientError::http)?;
        let payload: MessagePayload = decode(response).await?;
        Ok(SendOutcome::Sent(
            self.append_sent_message(&community_id.as_conversation(), payload)
                .await,
        ))
    }

    /// Optimistic append of the server-returned message object. Using the
    /// server's copy (not a locally fabricated one) keeps the id and
    /// timestamp identical to what other clients receive, so the later
    /// rebroadcast deduplicates in the reconciler.
    async fn append_sent_message(
        &self,
        conversation: &ConversationId,
        payload: MessagePayload,
    ) -> Message {
        let mut message = normalize::message(payload);
        message
            .conversation
            .get_or_insert_with(|| conversation.clone());
        self.state.lock().await.on_new_message(message.clone());
        message
    }

    // ---- conversations & communities ----

    pub async fn create_direct_conversation(
        &self,
        other: &Participant,
    ) -> Result<Conversation, ClientError> {
        let me = self.require_user()?;
        let body = CreateConversationRequest {
            participants: vec![
                ConversationParticipant {
                    participant_id: me,
                    participant_type: self.identity.role.as_user_type().to_string(),
                },
                ConversationParticipant {
                    participant_id: other.id.clone(),
                    participant_type: Role::Student.as_user_type().to_string(),
                },
            ],
        };
        let response = self
            .request(Method::POST, "/api/messages/conversations")?
            .json(&body)
            .send()
            .await
            .map_err(ClientError::http)?;
        let payload: ConversationPayload = decode(response).await?;
        let mut conversation = normalize::conversation(payload);

        let mut state = self.state.lock().await;
        if conversation.participants.is_empty() {
            conversation.participants = vec![state.user().clone(), other.clone()];
        }
        state.on_new_conversation(conversation.clone());
        Ok(conversation)
    }

    pub async fn create_community(&self, new: NewCommunity) -> Result<Community, ClientError> {
        if new.name.trim().is_empty() {
            return Err(ClientError::Api {
                code: ErrorCode::Validation,
                message: "community name is required".to_string(),
            });
        }
        let me = self.require_user()?;

        let mut form = reqwest::multipart::Form::new()
            .text("name", new.name)
            .text("description", new.description)
            .text("creator", me.to_string())
            .text("creatorRole", self.identity.role.as_str().to_string());
        if let Some(image) = new.image {
            form = form.part(
                "image",
                reqwest::multipart::Part::bytes(image.bytes).file_name(image.file_name),
            );
        }

        let response = self
            .request(Method::POST, "/api/messages/communities")?
            .multipart(form)
            .send()
            .await
            .map_err(ClientError::http)?;
        let created: CreateCommunityResponse = decode(response).await?;

        let community = normalize::community(created.community.clone());
        let conversation = normalize::community_conversation(&created.community);
        self.state
            .lock()
            .await
            .upsert_community(community.clone(), conversation);
        Ok(community)
    }

    pub async fn get_community(&self, id: &CommunityId) -> Result<Community, ClientError> {
        Ok(normalize::community(self.fetch_community_payload(id).await?))
    }

    pub async fn search_communities(&self, query: &str) -> Result<Vec<Community>, ClientError> {
        let response = self
            .request(Method::GET, "/api/messages/communities/search")?
            .query(&[("query", query)])
            .send()
            .await
            .map_err(ClientError::http)?;
        let payloads: Vec<CommunityPayload> = decode(response).await?;
        Ok(payloads.into_iter().map(normalize::community).collect())
    }

    pub async fn list_all_communities(&self) -> Result<Vec<Community>, ClientError> {
        let response = self
            .request(Method::GET, "/api/messages/all-communities")?
            .send()
            .await
            .map_err(ClientError::http)?;
        let payloads: Vec<CommunityPayload> = decode(response).await?;
        Ok(payloads.into_iter().map(normalize::community).collect())
    }

    pub async fn leave_community(&self, community: &CommunityId) -> Result<(), ClientError> {
        let me = self.require_user()?;
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/communities/{community}/leave"),
            )?
            .send()
            .await
            .map_err(ClientError::http)?;
        expect_ok(response).await?;

        // Leaving removes membership, never the conversation itself.
        let mut state = self.state.lock().await;
        let conversation_id = community.as_conversation();
        if let Some(entry) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            entry.participants.retain(|p| p.id != me);
        }
        state.my_communities.retain(|c| &c.id != community);
        Ok(())
    }

    // ---- membership workflows ----

    /// Invitation permission is enforced server-side; this surfaces a
    /// duplicate pending invitation as its recoverable error and notifies
    /// the target over the live session on success.
    pub async fn send_invitation(
        &self,
        community: &CommunityId,
        target: &Participant,
    ) -> Result<(), ClientError> {
        self.require_user()?;
        let body = SendInvitationRequest {
            user_id: target.id.clone(),
            sender_role: self.identity.role,
            sender_name: self.identity.name.clone(),
        };
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/communities/{community}/invite"),
            )?
            .json(&body)
            .send()
            .await
            .map_err(ClientError::http)?;
        if let Err(err) = expect_ok(response).await {
            if err.is_duplicate() {
                return Err(ClientError::InvitationPending);
            }
            return Err(err);
        }

        self.emit_signal(ClientSignal::InvitationSent {
            recipient: target.id.clone(),
        })
        .await;
        Ok(())
    }

    /// Accepts an invitation and removes it from the local pending list
    /// unconditionally: a stale duplicate accept is rejected server-side, so
    /// optimistic removal is safe. The community is refetched afterwards so
    /// the new membership is visible locally; a failed refresh is non-fatal.
    pub async fn accept_invitation(
        &self,
        id: &InvitationId,
    ) -> Result<Option<Community>, ClientError> {
        let response = self
            .request(Method::PATCH, &format!("/api/invitations/{id}/accept"))?
            .send()
            .await
            .map_err(ClientError::http)?;
        expect_ok(response).await?;

        let community_id = {
            let mut state = self.state.lock().await;
            state.remove_invitation(id).map(|inv| inv.community.id)
        };

        if let Some(community_id) = community_id {
            match self.fetch_community_payload(&community_id).await {
                Ok(payload) => {
                    let community = normalize::community(payload.clone());
                    let conversation = normalize::community_conversation(&payload);
                    self.state
                        .lock()
                        .await
                        .upsert_community(community.clone(), conversation);
                    return Ok(Some(community));
                }
                Err(err) => {
                    warn!(
                        %err,
                        community = %community_id,
                        "failed to refresh community after accepting invitation"
                    );
                }
            }
        }
        Ok(None)
    }

    pub async fn reject_invitation(&self, id: &InvitationId) -> Result<(), ClientError> {
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/communities/invite/{id}/reject"),
            )?
            .send()
            .await
            .map_err(ClientError::http)?;
        expect_ok(response).await?;
        self.state.lock().await.remove_invitation(id);
        Ok(())
    }

    /// Issues a join request. A duplicate pending request surfaces as
    /// [`ClientError::JoinRequestPending`], and the local "sent" flag clears
    /// itself after a fixed delay regardless of server confirmation.
    pub async fn request_join(&self, community: &CommunityId) -> Result<(), ClientError> {
        let me = self.require_user()?;
        let request_user = RequestUser {
            id: me.clone(),
            name: self.identity.name.clone(),
            user_type: self.identity.role.as_user_type().to_string(),
        };
        let body = JoinRequestBody {
            user_id: me,
            user_type: self.identity.role.as_user_type().to_string(),
            user: request_user.clone(),
        };
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/communities/{community}/request"),
            )?
            .json(&body)
            .send()
            .await
            .map_err(ClientError::http)?;
        if let Err(err) = expect_ok(response).await {
            if err.is_duplicate() {
                return Err(ClientError::JoinRequestPending);
            }
            return Err(err);
        }

        self.state
            .lock()
            .await
            .mark_join_request_sent(community.clone());
        let state = Arc::clone(&self.state);
        let community_id = community.clone();
        let reset_after = self.config.join_request_flag_reset;
        tokio::spawn(async move {
            tokio::time::sleep(reset_after).await;
            state.lock().await.clear_join_request_sent(&community_id);
        });

        self.emit_signal(ClientSignal::JoinRequestSent {
            community_id: community.clone(),
            user: request_user,
        })
        .await;
        Ok(())
    }

    pub async fn accept_join_request(
        &self,
        community: &CommunityId,
        user: &UserId,
    ) -> Result<(), ClientError> {
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/communities/{community}/request/{user}/accept"),
            )?
            .send()
            .await
            .map_err(ClientError::http)?;
        expect_ok(response).await?;
        self.state.lock().await.remove_join_request(community, user);
        Ok(())
    }

    pub async fn reject_join_request(
        &self,
        community: &CommunityId,
        user: &UserId,
    ) -> Result<(), ClientError> {
        let response = self
            .request(
                Method::POST,
                &format!("/api/messages/communities/{community}/request/{user}/reject"),
            )?
            .send()
            .await
            .map_err(ClientError::http)?;
        expect_ok(response).await?;
        self.state.lock().await.remove_join_request(community, user);
        Ok(())
    }

    // ---- state views ----

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().await.conversations.clone()
    }

    pub async fn my_communities(&self) -> Vec<Community> {
        self.state.lock().await.my_communities.clone()
    }

    pub async fn pending_invitations(&self) -> Vec<Invitation> {
        self.state.lock().await.pending_invitations.clone()
    }

    pub async fn pending_join_requests(&self) -> Vec<JoinRequest> {
        self.state.lock().await.pending_join_requests.clone()
    }

    // ---- plumbing ----

    fn require_user(&self) -> Result<UserId, ClientError> {
        self.identity
            .user_id
            .clone()
            .ok_or(ClientError::MissingIdentity)
    }

    async fn fetch_community_payload(
        &self,
        id: &CommunityId,
    ) -> Result<CommunityPayload, ClientError> {
        let response = self
            .request(Method::GET, &format!("/api/messages/communities/{id}"))?
            .send()
            .await
            .map_err(ClientError::http)?;
        decode(response).await
    }

    fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, ClientError> {
        let token = self.tokens.bearer().ok_or(ClientError::Unauthenticated)?;
        let url = format!(
            "{}{}",
            self.config.api_base_url.trim_end_matches('/'),
            path
        );
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("x-request-id", Uuid::new_v4().to_string()))
    }
}

#[async_trait]
impl MessagingHandle for MessagingClient {
    async fn load_snapshot(&self) -> Vec<SnapshotWarning> {
        MessagingClient::load_snapshot(self).await
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<SendOutcome, ClientError> {
        MessagingClient::send_message(self, conversation, content).await
    }

    async fn send_invitation(
        &self,
        community: &CommunityId,
        target: &Participant,
    ) -> Result<(), ClientError> {
        MessagingClient::send_invitation(self, community, target).await
    }

    async fn accept_invitation(
        &self,
        id: &InvitationId,
    ) -> Result<Option<Community>, ClientError> {
        MessagingClient::accept_invitation(self, id).await
    }

    async fn reject_invitation(&self, id: &InvitationId) -> Result<(), ClientError> {
        MessagingClient::reject_invitation(self, id).await
    }

    async fn request_join(&self, community: &CommunityId) -> Result<(), ClientError> {
        MessagingClient::request_join(self, community).await
    }

    async fn accept_join_request(
        &self,
        community: &CommunityId,
        user: &UserId,
    ) -> Result<(), ClientError> {
        MessagingClient::accept_join_request(self, community, user).await
    }

    async fn reject_join_request(
        &self,
        community: &CommunityId,
        user: &UserId,
    ) -> Result<(), ClientError> {
        MessagingClient::reject_join_request(self, community, user).await
    }

    async fn conversations(&self) -> Vec<Conversation> {
        MessagingClient::conversations(self).await
    }

    async fn pending_invitations(&self) -> Vec<Invitation> {
        MessagingClient::pending_invitations(self).await
    }

    async fn pending_join_requests(&self) -> Vec<JoinRequest> {
        MessagingClient::pending_join_requests(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        MessagingClient::subscribe_events(self)
    }
}

/// Defensive: if the backend returns the same community twice, the first
/// occurrence wins.
fn dedupe_communities(communities: Vec<CommunityPayload>) -> Vec<CommunityPayload> {
    let mut seen = HashSet::new();
    communities
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect()
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        response.json::<T>().await.map_err(ClientError::http)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::from_response(status, &body))
    }
}

async fn expect_ok(response: reqwest::Response) -> Result<(), ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::from_response(status, &body))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
