//! Session lifecycle entry points.
//!
//! A session moves through `provisioning -> pending handshake -> live ->
//! ended`. [`SessionBroker::create_session`] covers the first two steps; the
//! handshake listener performs the third; the connection closing (remote end,
//! error, `endSession`, or a purge) performs the last.

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::codec::{Command, BROKER_CORRELATION_ID};
use crate::error::BrokerError;
use crate::handshake::{HandshakeConfig, HandshakeService};
use crate::orchestrator::ContainerOrchestrator;
use crate::pending::{PendingHandshake, PendingHandshakes};
use crate::registry::{Connection, SessionRegistry};
use crate::router::{MessageRouter, ResponseHandler, DEFAULT_OUTBOUND_BUFFER};
use crate::sanitize::sanitize_label;
use crate::store::{RecordStore, SessionQuery, SessionRecord};

pub const DEFAULT_SESSION_LENGTH_MINUTES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSession {
    pub title: String,
    pub description: String,
    pub account_id: String,
    /// Minutes. Recorded only; the broker never ends a session on a timer.
    #[serde(default)]
    pub session_length: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub title: String,
    pub description: String,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMembership {
    pub session_id: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    PendingHandshake,
    Live,
    /// Never created, already ended, or purged.
    Inactive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub containers_removed: usize,
    pub connections_closed: usize,
    pub pending_cleared: usize,
    /// `false` when dropping the durable session collection failed.
    pub records_dropped: bool,
}

pub struct SessionBroker {
    orchestrator: ContainerOrchestrator,
    store: Arc<dyn RecordStore>,
    pending: Arc<PendingHandshakes>,
    router: MessageRouter,
    response_handler: Arc<dyn ResponseHandler>,
}

impl SessionBroker {
    pub fn new(
        orchestrator: ContainerOrchestrator,
        store: Arc<dyn RecordStore>,
        response_handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            pending: Arc::new(PendingHandshakes::new()),
            router: MessageRouter::new(Arc::new(SessionRegistry::new()), DEFAULT_OUTBOUND_BUFFER),
            response_handler,
        }
    }

    pub fn with_outbound_buffer(mut self, outbound_buffer: usize) -> Self {
        self.router = MessageRouter::new(Arc::clone(self.router.registry()), outbound_buffer);
        self
    }

    pub fn pending(&self) -> &Arc<PendingHandshakes> {
        &self.pending
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.router.registry()
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Service that completes handshakes against this broker's tables.
    pub fn handshake_service(&self, config: HandshakeConfig) -> HandshakeService {
        HandshakeService::new(
            Arc::clone(&self.pending),
            self.router.clone(),
            self.orchestrator.control_port(),
            config,
        )
    }

    /// Provisions a container, writes the durable records and installs the
    /// pending handshake.
    ///
    /// Nothing durable is written when provisioning fails. A purge that starts
    /// before the pending entry is in place wins: the session is abandoned and
    /// its records are withdrawn.
    pub async fn create_session(
        &self,
        request: CreateSession,
    ) -> Result<CreatedSession, BrokerError> {
        let title = sanitize_label(&request.title);
        let description = sanitize_label(&request.description);
        let length = request
            .session_length
            .unwrap_or(DEFAULT_SESSION_LENGTH_MINUTES);

        let epoch = self.registry().epoch();
        let provisioned = self
            .orchestrator
            .provision(&title, &description, length)
            .await?;
        let session_id = provisioned.container_id.into_string();
        self.ensure_not_purged(&session_id, epoch)?;

        // The document insert doubles as the duplicate check, so a clashing id
        // never touches the pending table or an account set.
        let record = SessionRecord::new(
            session_id.clone(),
            title.clone(),
            description.clone(),
            length,
            provisioned.address.to_string(),
            request.account_id.clone(),
        );
        self.store.insert_session(record).await?;
        if let Err(err) = self
            .store
            .add_session_to_account(&request.account_id, &session_id)
            .await
        {
            self.withdraw_records(&request.account_id, &session_id).await;
            return Err(err.into());
        }
        if let Err(err) = self.ensure_not_purged(&session_id, epoch) {
            self.withdraw_records(&request.account_id, &session_id).await;
            return Err(err);
        }

        let handshake = PendingHandshake::new(
            request.account_id.clone(),
            provisioned.address,
            Arc::clone(&self.response_handler),
        );
        let installed_at = handshake.created_at;
        self.pending.insert(session_id.clone(), handshake);
        if let Err(err) = self.ensure_not_purged(&session_id, epoch) {
            self.pending.withdraw(&session_id, installed_at);
            self.withdraw_records(&request.account_id, &session_id).await;
            return Err(err);
        }

        counter!("jam_broker_sessions_provisioned_total", 1);
        info!(
            session_id = %session_id,
            account_id = %request.account_id,
            address = %provisioned.address,
            length_minutes = length,
            "session pending handshake"
        );

        Ok(CreatedSession {
            session_id,
            title,
            description,
            length,
        })
    }

    fn ensure_not_purged(&self, session_id: &str, epoch: u64) -> Result<(), BrokerError> {
        if self.registry().epoch() == epoch {
            return Ok(());
        }
        warn!(session_id = %session_id, "purge ran during session creation; abandoning session");
        Err(BrokerError::PurgedDuringProvision {
            session_id: session_id.to_string(),
        })
    }

    async fn withdraw_records(&self, account_id: &str, session_id: &str) {
        if let Err(err) = self.store.remove_session(account_id, session_id).await {
            warn!(
                session_id = %session_id,
                error = %err,
                "failed to withdraw records of an abandoned session"
            );
        }
    }

    /// Returns whether the command was queued; no-op unless the session is live.
    pub fn join_session(&self, membership: &SessionMembership) -> bool {
        self.send_command(
            &membership.session_id,
            Command::AddAccount(membership.account_id.clone()),
        )
    }

    pub fn leave_session(&self, membership: &SessionMembership) -> bool {
        self.send_command(
            &membership.session_id,
            Command::DeleteAccount(membership.account_id.clone()),
        )
    }

    /// Asks the container to end the session. The registry entry goes away
    /// when the container closes the control connection.
    pub fn end_session(&self, session_id: &str) -> bool {
        self.send_command(session_id, Command::EndSession)
    }

    fn send_command(&self, session_id: &str, command: Command) -> bool {
        self.router
            .send(session_id, BROKER_CORRELATION_ID, &command.into_payload())
    }

    /// Raw write of caller-serialized data; see [`MessageRouter::write`].
    pub fn write(&self, session_id: &str, correlation_id: &str, data: &str) -> bool {
        self.router.write(session_id, correlation_id, data)
    }

    pub async fn find_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<SessionRecord>, BrokerError> {
        Ok(self.store.find_sessions(query).await?)
    }

    pub fn get_sessions(&self) -> Vec<(String, Connection)> {
        self.router.list_active()
    }

    pub fn phase(&self, session_id: &str) -> SessionPhase {
        if self.registry().contains(session_id) {
            SessionPhase::Live
        } else if self.pending.contains(session_id) {
            SessionPhase::PendingHandshake
        } else {
            SessionPhase::Inactive
        }
    }

    /// Administrative, non-graceful reset of every session.
    ///
    /// Container teardown and dropping session records are best-effort;
    /// only the final membership reset propagates its error.
    pub async fn purge_sessions(&self) -> Result<PurgeReport, BrokerError> {
        let mut report = PurgeReport::default();
        self.registry().advance_epoch();

        match self.orchestrator.teardown_all().await {
            Ok(removed) => report.containers_removed = removed,
            Err(err) => warn!(error = %err, "container teardown failed; continuing purge"),
        }

        match self.store.drop_sessions().await {
            Ok(()) => report.records_dropped = true,
            Err(err) => warn!(error = %err, "failed to drop session records; continuing purge"),
        }

        report.connections_closed = self.registry().clear();
        report.pending_cleared = self.pending.clear();

        self.store.clear_account_sessions().await?;

        info!(
            containers_removed = report.containers_removed,
            connections_closed = report.connections_closed,
            pending_cleared = report.pending_cleared,
            records_dropped = report.records_dropped,
            "purged sessions"
        );
        Ok(report)
    }
}
