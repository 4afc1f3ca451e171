//! Relay engine — the heart of relayd.
//!
//! Flow per connection:
//! 1. `Relay::accept` creates a `Session` in `Connecting`
//! 2. `Session::authenticate` verifies the credential, registers the
//!    connection and moves to `Authenticated` (or straight to `Closed`)
//! 3. `Session::process` handles each inbound event in arrival order:
//!    validate, persist, resolve participants, fan out
//! 4. `Session::close` (or drop) deregisters exactly once
//!
//! The session is transport-agnostic; `ws` drives it from a socket.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Identity, TokenVerifier};
use crate::dispatch::{Dispatcher, Outbox};
use crate::error::RelayError;
use crate::protocol::{ClientEvent, HistoryResultMsg, SendEvent, ServerEvent};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{ConversationId, MembershipResolver, Message, MessageStore};

/// Process-wide relay service. Built once at bootstrap and shared by every
/// connection task.
pub struct Relay {
    verifier: TokenVerifier,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
    store: Arc<dyn MessageStore>,
    members: Arc<dyn MembershipResolver>,
    max_message_len: usize,
}

/// Result of a successful send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Push attempts made during fan-out, one per live recipient connection.
    pub attempts: usize,
}

impl Relay {
    pub fn new(
        verifier: TokenVerifier,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        members: Arc<dyn MembershipResolver>,
        max_message_len: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            verifier,
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            registry,
            store,
            members,
            max_message_len,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Start a session for a freshly accepted transport. `outbox` is the
    /// connection's outbound queue.
    pub fn accept(self: &Arc<Self>, outbox: Outbox) -> Session {
        let id = Uuid::new_v4();
        debug!(conn_id = %id, "connection accepted");
        Session {
            relay: Arc::clone(self),
            id,
            state: SessionState::Connecting,
            identity: None,
            outbox,
        }
    }

    /// Persist, then fan out to every participant's live connections.
    ///
    /// Nothing is broadcast unless `append` succeeded. If participants
    /// cannot be resolved afterwards the message stays persisted and the
    /// error reports the partial failure.
    async fn send_message(
        &self,
        author: &Identity,
        event: SendEvent,
    ) -> Result<Delivery, RelayError> {
        let conversation_id = event.conversation_id;
        let message = self
            .store
            .append(conversation_id, author.user_id, &event.content)
            .await
            .map_err(RelayError::Storage)?;

        info!(
            message_id = message.id,
            conversation_id,
            author_id = author.user_id,
            "message persisted"
        );

        let participants = self
            .members
            .participants_of(conversation_id)
            .await
            .map_err(|source| RelayError::Membership {
                message_id: message.id,
                source,
            })?;

        let attempts = self
            .dispatcher
            .broadcast(&participants, &ServerEvent::Message(message.clone()));

        debug!(
            message_id = message.id,
            conversation_id,
            recipients = participants.len(),
            attempts,
            "message fanned out"
        );

        Ok(Delivery { message, attempts })
    }

    async fn history(
        &self,
        requester: &Identity,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, RelayError> {
        let participants = self
            .members
            .participants_of(conversation_id)
            .await
            .map_err(RelayError::Storage)?;
        if !participants.contains(&requester.user_id) {
            return Err(RelayError::NotParticipant(conversation_id));
        }
        self.store
            .history(conversation_id)
            .await
            .map_err(RelayError::Storage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        }
    }
}

/// One connection's lifecycle: `Connecting → Authenticated → Closed`, or
/// `Connecting → Closed` on a refused credential. No state is re-entered.
pub struct Session {
    relay: Arc<Relay>,
    id: ConnectionId,
    state: SessionState,
    identity: Option<Identity>,
    outbox: Outbox,
}

/// What a processed event produced.
#[derive(Debug)]
pub enum Outcome {
    Sent(Delivery),
    History { conversation_id: ConversationId, count: usize },
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Verify the handshake credential. On success the connection is
    /// registered and receives an `authenticated` event; on failure the
    /// session is closed and never registered.
    pub fn authenticate(&mut self, token: &str) -> Result<Identity, RelayError> {
        if self.state != SessionState::Connecting {
            return Err(RelayError::Protocol(format!(
                "cannot authenticate a {} connection",
                self.state.as_str()
            )));
        }

        let identity = match self.relay.verifier.verify(token) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(conn_id = %self.id, "authentication failed: {e}");
                self.state = SessionState::Closed;
                let err = RelayError::Auth(e);
                self.emit(ServerEvent::from(&err));
                return Err(err);
            }
        };

        self.state = SessionState::Authenticated;
        self.relay.dispatcher.attach(self.id, self.outbox.clone());
        let first = self.relay.registry.register(identity.user_id, self.id);
        self.emit(ServerEvent::authenticated(&identity, self.id));

        info!(
            conn_id = %self.id,
            user_id = identity.user_id,
            username = %identity.username,
            first_connection = first,
            "user connected"
        );

        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Handle one inbound event. Failures are reported to this connection
    /// only, as an `error` event; the connection stays open.
    pub async fn process(&mut self, event: ClientEvent) -> Result<Outcome, RelayError> {
        let result = self.handle(event).await;
        if let Err(e) = &result {
            match e {
                RelayError::Membership { .. } | RelayError::Storage(_) => {
                    warn!(conn_id = %self.id, "send failed: {e}")
                }
                _ => debug!(conn_id = %self.id, "event rejected: {e}"),
            }
            self.emit(ServerEvent::from(e));
        }
        result
    }

    /// Report an error that arose outside `process`, such as an
    /// unparseable frame.
    pub fn reject(&self, err: &RelayError) {
        debug!(conn_id = %self.id, "frame rejected: {err}");
        self.emit(ServerEvent::from(err));
    }

    async fn handle(&mut self, event: ClientEvent) -> Result<Outcome, RelayError> {
        let identity = match (&self.state, &self.identity) {
            (SessionState::Authenticated, Some(identity)) => identity.clone(),
            _ => {
                return Err(RelayError::Protocol(format!(
                    "connection is {}",
                    self.state.as_str()
                )))
            }
        };

        match event {
            ClientEvent::Auth(_) => Err(RelayError::Protocol("already authenticated".into())),
            ClientEvent::SendMessage(msg) => {
                let event = msg.validate(self.relay.max_message_len)?;
                let delivery = self.relay.send_message(&identity, event).await?;
                Ok(Outcome::Sent(delivery))
            }
            ClientEvent::History(msg) => {
                let conversation_id = msg.conversation_id.resolve()?;
                let messages = self.relay.history(&identity, conversation_id).await?;
                let count = messages.len();
                self.emit(ServerEvent::History(HistoryResultMsg {
                    conversation_id,
                    messages,
                }));
                Ok(Outcome::History {
                    conversation_id,
                    count,
                })
            }
        }
    }

    /// Tear down. Runs at most once no matter how often it is called.
    pub fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if previous != SessionState::Authenticated {
            return;
        }
        self.relay.dispatcher.detach(self.id);
        if let Some(identity) = &self.identity {
            let last = self.relay.registry.unregister(identity.user_id, self.id);
            info!(
                conn_id = %self.id,
                user_id = identity.user_id,
                last_connection = last,
                "user disconnected"
            );
        }
    }

    fn emit(&self, event: ServerEvent) {
        // The writer may already be gone; nothing to do then.
        let _ = self.outbox.send(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
