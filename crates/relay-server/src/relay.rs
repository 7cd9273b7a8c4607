//! Broadcast-and-optionally-wait on top of the connection registry and the
//! correlation table.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use relay_core::messages::RelayMessage;
use relay_core::RelayError;

use crate::client::ClientRegistry;
use crate::pending::PendingRequests;

pub struct Relay {
    clients: Arc<ClientRegistry>,
    pending: Arc<PendingRequests>,
    default_timeout: Duration,
}

impl Relay {
    pub fn new(
        clients: Arc<ClientRegistry>,
        pending: Arc<PendingRequests>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            clients,
            pending,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Fire and forget. Returns the number of connections the message was
    /// written to, which may be zero.
    #[instrument(skip_all, fields(kind = %message.kind))]
    pub fn publish(&self, mut message: RelayMessage) -> Result<usize, RelayError> {
        message.stamp();
        let sent = self.clients.broadcast(&message)?;
        info!(recipients = sent, "published");
        Ok(sent)
    }

    /// Broadcast a request and wait for the first correlated reply.
    ///
    /// Fails immediately with [`RelayError::NoClients`] when nobody is open
    /// to receive it; no timer is started in that case.
    #[instrument(skip_all, fields(kind = %message.kind, request_id))]
    pub async fn send_and_await(
        &self,
        mut message: RelayMessage,
        timeout: Option<Duration>,
    ) -> Result<Value, RelayError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (request_id, reply) = self.pending.register();
        let _ = tracing::Span::current().record("request_id", request_id.as_str());

        message.request_id = Some(request_id.clone());
        message.stamp();

        let sent = match self.clients.broadcast(&message) {
            Ok(n) => n,
            Err(e) => {
                let _ = self.pending.discard(&request_id);
                return Err(e);
            }
        };
        if sent == 0 {
            let _ = self.pending.discard(&request_id);
            warn!("no clients connected");
            return Err(RelayError::NoClients);
        }

        self.pending.arm(&request_id, timeout);
        debug!(recipients = sent, ?timeout, "awaiting reply");

        let outcome = reply.wait().await;
        match &outcome {
            Ok(_) => info!("request succeeded"),
            Err(e) => warn!(error_kind = e.error_kind(), error = %e, "request failed"),
        }
        outcome
    }
}
