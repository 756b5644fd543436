use crate::service::SessionController;
use crate::storage::CredentialStore;
use std::sync::Arc;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionController>,
    pub credentials: Arc<CredentialStore>,
}
