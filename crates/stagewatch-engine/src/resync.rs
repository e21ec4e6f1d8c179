use std::sync::Arc;

use tracing::{info, warn};

use stagewatch_core::traits::ResyncSource;

use crate::reconcile::{ReconciliationEngine, ResyncSummary};

/// Result of handling one reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Statuses were re-fetched and reconciled; any open gap is closed.
    Resynced(ResyncSummary),
    /// No authoritative data; last known status kept and a gap flagged.
    Degraded { reason: String },
}

/// What to do after the event stream reconnects.
///
/// The transport gives no redelivery guarantee, so every reconnect either
/// re-fetches the authoritative status of all nodes or, without a source,
/// falls back to best effort and flags a visibility gap.
pub struct BackfillPolicy {
    source: Option<Arc<dyn ResyncSource>>,
}

impl BackfillPolicy {
    pub fn new(source: Option<Arc<dyn ResyncSource>>) -> Self {
        Self { source }
    }

    /// Best effort only.
    pub fn best_effort() -> Self {
        Self { source: None }
    }

    pub async fn on_reconnect(&self, engine: &ReconciliationEngine) -> ReconnectOutcome {
        let Some(source) = self.source.as_ref() else {
            let reason = "reconnected without a resync source".to_string();
            engine.mark_visibility_gap(reason.clone());
            return ReconnectOutcome::Degraded { reason };
        };

        let reports = match source.fetch_statuses().await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, "Resync fetch failed");
                let reason = format!("resync failed: {}", e);
                engine.mark_visibility_gap(reason.clone());
                return ReconnectOutcome::Degraded { reason };
            }
        };

        info!(reports = reports.len(), "Resync fetched");
        match engine.apply_resync(reports) {
            Ok(summary) => {
                engine.clear_visibility_gap();
                ReconnectOutcome::Resynced(summary)
            }
            Err(e) => {
                let reason = format!("resync not applied: {}", e);
                engine.mark_visibility_gap(reason.clone());
                ReconnectOutcome::Degraded { reason }
            }
        }
    }
}
