// =============================================================================
// Audit Workflow — human review of quarantined events
// =============================================================================
//
// Quarantined events wait in the durable queue as pending records. A decision
// transitions pending -> approved/rejected exactly once; deciding an
// already-decided record is a conflict. Approval re-hands the event to the
// scoring/blending path exactly as the normal ingest flow would, then marks
// the event processed. Rejection records the reason; the event stays
// unprocessed forever.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::broadcast::{Broadcaster, FeedMessage};
use crate::ingest::IngestGateway;
use crate::store::events::DecideAudit;
use crate::store::Db;
use crate::types::{AuditRecord, AuditState};

pub struct AuditDesk {
    db: Arc<Db>,
    gateway: Arc<IngestGateway>,
    broadcaster: Broadcaster,
}

impl AuditDesk {
    pub fn new(db: Arc<Db>, gateway: Arc<IngestGateway>, broadcaster: Broadcaster) -> Self {
        Self {
            db,
            gateway,
            broadcaster,
        }
    }

    /// Audit records, newest first.
    pub async fn list(&self, pending_only: bool) -> Result<Vec<AuditRecord>, ApiError> {
        Ok(self.db.list_audits(pending_only).await?)
    }

    /// Decide a pending record. Exactly-once: any later attempt fails with
    /// `already_processed`.
    pub async fn decide(
        &self,
        id: Uuid,
        approver: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> Result<AuditRecord, ApiError> {
        let decided = self
            .db
            .decide_audit(id, approve, approver, reason, Utc::now())
            .await?;

        let record = match decided {
            DecideAudit::NotFound => {
                return Err(ApiError::NotFound(format!("audit {id} not found")))
            }
            DecideAudit::AlreadyDecided => {
                return Err(ApiError::Conflict("already_processed".to_string()))
            }
            DecideAudit::Decided(record) => record,
        };

        if record.state == AuditState::Approved {
            // Re-run the normal path for every referenced symbol.
            let event = self
                .db
                .get_event(record.event_id)
                .await?
                .with_context(|| format!("audited event {} missing", record.event_id))?;

            if let Err(e) = self.gateway.apply_event(&event).await {
                // The decision stands; the event stays unprocessed and the
                // failure is surfaced to the operator.
                error!(
                    event_id = %record.event_id,
                    error = ?e,
                    "approved event failed to apply"
                );
                return Err(e);
            }
        }

        info!(
            audit_id = %record.id,
            event_id = %record.event_id,
            state = %record.state,
            approver,
            "audit decided"
        );

        self.broadcaster.publish(FeedMessage::AuditEvent {
            event_id: record.event_id,
            symbol: record.symbol.clone(),
            delta: record.impact,
            state: record.state.to_string(),
            reason: record.reason.clone(),
            ts: record.decided_at.unwrap_or_else(Utc::now),
        });

        Ok(record)
    }
}
