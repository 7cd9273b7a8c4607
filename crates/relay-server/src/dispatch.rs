//! Routes inbound plugin frames to the correlation table or the data caches.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::analysis::{Summarizer, SummaryRequest};
use relay_core::messages::{
    error_reason, payload_count, ClientMessage, OutboundKind, RelayMessage,
};
use relay_core::{ClientId, RelayError, RequestId};

use crate::cache::DataCaches;
use crate::client::{ClientRegistry, InboundFrame};
use crate::pending::PendingRequests;

/// Error text sent back for `analyze` when no summarizer is configured.
pub const ANALYSIS_UNAVAILABLE: &str = "analysis unavailable";

/// What the dispatcher did with one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dispatched {
    Pong,
    Selection { correlated: bool },
    OperationResult { matched: bool },
    Variables,
    Analysis,
    UnknownKind,
    Malformed,
}

pub struct Dispatcher {
    clients: Arc<ClientRegistry>,
    pending: Arc<PendingRequests>,
    caches: Arc<DataCaches>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl Dispatcher {
    pub fn new(
        clients: Arc<ClientRegistry>,
        pending: Arc<PendingRequests>,
        caches: Arc<DataCaches>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        Self {
            clients,
            pending,
            caches,
            summarizer,
        }
    }

    /// Drain the shared inbound channel, one frame at a time.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundFrame>) {
        while let Some((client_id, text)) = rx.recv().await {
            let _ = self.handle(&client_id, &text);
        }
        debug!("inbound channel closed, dispatcher exiting");
    }

    /// Classify and apply one frame from `client_id`.
    pub fn handle(&self, client_id: &ClientId, text: &str) -> Dispatched {
        let value: Value = match serde_json::from_str(text) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                warn!(client_id = %client_id, "dropping non-object frame");
                return Dispatched::Malformed;
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "dropping unparseable frame");
                return Dispatched::Malformed;
            }
        };

        let raw_kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("<missing>");
        let message = match ClientMessage::deserialize(&value) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    kind = raw_kind,
                    error = %e,
                    "dropping malformed frame"
                );
                return Dispatched::Malformed;
            }
        };

        debug!(client_id = %client_id, kind = message.kind(), "inbound frame");

        match message {
            ClientMessage::Ping => {
                if let Err(e) = self.clients.send_message(client_id, &RelayMessage::pong()) {
                    warn!(client_id = %client_id, error = %e, "failed to send pong");
                }
                Dispatched::Pong
            }
            ClientMessage::Selection { request_id, nodes } => {
                self.store_if_connected(client_id, |caches| {
                    let count = payload_count(&nodes);
                    caches.selection.store(client_id, nodes, count);
                });
                let correlated = match request_id {
                    Some(id) => self.resolve(&id, value),
                    None => false,
                };
                Dispatched::Selection { correlated }
            }
            ClientMessage::OperationResult {
                request_id,
                success,
                error,
            } => {
                let Some(id) = request_id else {
                    debug!(client_id = %client_id, "operation-result without requestId");
                    return Dispatched::OperationResult { matched: false };
                };
                let matched = if success {
                    self.resolve(&id, value)
                } else {
                    self.reject(&id, RelayError::rejected(error_reason(error)))
                };
                Dispatched::OperationResult { matched }
            }
            ClientMessage::Variables { variables } => {
                self.store_if_connected(client_id, |caches| {
                    let count = payload_count(&variables);
                    caches.variables.store(client_id, variables, count);
                });
                Dispatched::Variables
            }
            ClientMessage::Analyze {
                request_id,
                content,
                instructions,
            } => {
                self.spawn_analysis(
                    client_id.clone(),
                    request_id,
                    SummaryRequest {
                        content,
                        instructions,
                    },
                );
                Dispatched::Analysis
            }
            ClientMessage::Unknown => {
                debug!(client_id = %client_id, kind = raw_kind, "ignoring unknown kind");
                Dispatched::UnknownKind
            }
        }
    }

    fn resolve(&self, id: &RequestId, value: Value) -> bool {
        let matched = self.pending.resolve(id, value);
        if !matched {
            debug!(request_id = %id, "no pending request for reply");
        }
        matched
    }

    fn reject(&self, id: &RequestId, error: RelayError) -> bool {
        let matched = self.pending.reject(id, error);
        if !matched {
            debug!(request_id = %id, "no pending request for rejection");
        }
        matched
    }

    /// Frames already queued when a connection closes must not repopulate
    /// the cache after its eviction. The store runs under the registry entry,
    /// so disconnect cleanup cannot unregister and evict in between.
    fn store_if_connected(&self, client_id: &ClientId, store: impl FnOnce(&DataCaches)) {
        let stored = self
            .clients
            .with_registered(client_id, |_| store(&self.caches))
            .is_some();
        if !stored {
            debug!(client_id = %client_id, "skipping cache store for closed connection");
        }
    }

    fn spawn_analysis(
        &self,
        client_id: ClientId,
        request_id: Option<RequestId>,
        request: SummaryRequest,
    ) {
        let clients = Arc::clone(&self.clients);
        let summarizer = self.summarizer.clone();
        let _ = tokio::spawn(async move {
            let outcome = match summarizer {
                Some(s) => s.summarize(request).await.map_err(|e| e.to_string()),
                None => Err(ANALYSIS_UNAVAILABLE.to_string()),
            };

            let mut reply = match outcome {
                Ok(summary) => RelayMessage::new(OutboundKind::AnalysisResult)
                    .with_field("success", json!(true))
                    .with_field("summary", json!(summary)),
                Err(error) => {
                    warn!(client_id = %client_id, error = %error, "analysis failed");
                    RelayMessage::new(OutboundKind::AnalysisResult)
                        .with_field("success", json!(false))
                        .with_field("error", json!(error))
                }
            };
            reply.request_id = request_id;
            reply.stamp();

            match clients.send_message(&client_id, &reply) {
                Ok(true) => {}
                Ok(false) => debug!(client_id = %client_id, "analysis result not delivered"),
                Err(e) => warn!(client_id = %client_id, error = %e, "failed to encode analysis result"),
            }
        });
    }
}
