//! Topic message handlers.

use async_trait::async_trait;
use std::future::Future;

use crate::envelope::Envelope;

/// Error returned by a handler. Its text becomes the dead-letter reason.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes messages consumed from a topic.
///
/// Returning `Err` schedules a retry, or dead-letters the message once its
/// retry budget is spent. Handlers may see the same message more than once
/// and should be idempotent.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self)(envelope).await
    }
}
