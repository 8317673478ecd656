use async_trait::async_trait;
use std::sync::Arc;

use super::ClientOptions;
use crate::Result;
use crate::connection::{Connection, Role};
use crate::frame::Tag;

/// What a client does once its handshake is accepted.
#[async_trait]
pub trait RoleBehavior: Send + Sync + 'static {
    fn role(&self) -> Role;

    /// Tags announced in the handshake. Empty means every tag.
    fn observed_tags(&self) -> Vec<Tag> {
        Vec::new()
    }

    /// Set up data streams on a freshly accepted connection.
    ///
    /// An error closes the connection and fails the connect attempt.
    async fn on_accepted(&self, conn: &Arc<Connection>, options: &ClientOptions) -> Result<()>;
}
