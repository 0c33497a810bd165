use {async_trait::async_trait, tether_sessions::SessionResolver};

/// Replaces the active session after the server deleted it.
#[async_trait]
pub trait SessionRenewer: Send + Sync {
    /// Forget `deleted_session_id` and return the session id to rebind to.
    async fn renew(&self, deleted_session_id: &str) -> Option<String>;
}

#[async_trait]
impl SessionRenewer for SessionResolver {
    async fn renew(&self, deleted_session_id: &str) -> Option<String> {
        self.invalidate(deleted_session_id).await;
        Some(self.resolve().await.id)
    }
}
