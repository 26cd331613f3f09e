use crate::session::{SessionError, SessionId, SubscriptionOptions};
use async_trait::async_trait;

/// Decides whether a session may subscribe to an entity.
///
/// Returning an error rejects the subscribe request with that error; the
/// registry records nothing.
#[async_trait]
pub trait SubscriptionAuthorizer: Send + Sync {
    async fn allow_subscription(
        &self,
        session: SessionId,
        id: &str,
        options: Option<&SubscriptionOptions>,
    ) -> Result<(), SessionError>;
}

/// Default policy: every subscription is allowed
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl SubscriptionAuthorizer for AllowAll {
    async fn allow_subscription(
        &self,
        _session: SessionId,
        _id: &str,
        _options: Option<&SubscriptionOptions>,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Allows only entity ids from a fixed list
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    ids: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SubscriptionAuthorizer for AllowList {
    async fn allow_subscription(
        &self,
        _session: SessionId,
        id: &str,
        _options: Option<&SubscriptionOptions>,
    ) -> Result<(), SessionError> {
        if self.ids.iter().any(|allowed| allowed == id) {
            Ok(())
        } else {
            Err(SessionError::Rejected(format!(
                "subscription to '{}' is not permitted",
                id
            )))
        }
    }
}
