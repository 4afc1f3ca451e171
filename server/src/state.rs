//! Shared server state.

use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::store::{MembershipResolver, MessageStore};

/// Shared state accessible from all handlers.
pub struct AppState {
    pub relay: Arc<Relay>,
    pub config: Config,
}

impl AppState {
    /// Wire the relay around a store that also resolves conversation
    /// membership.
    pub fn new<S>(config: Config, jwt_secret: &[u8], store: Arc<S>) -> Arc<Self>
    where
        S: MessageStore + MembershipResolver + 'static,
    {
        let relay = Relay::new(
            TokenVerifier::new(jwt_secret),
            Arc::new(ConnectionRegistry::new()),
            Arc::clone(&store) as Arc<dyn MessageStore>,
            store as Arc<dyn MembershipResolver>,
            config.max_message_len,
        );
        Arc::new(Self { relay, config })
    }
}
