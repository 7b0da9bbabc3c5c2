//! Periodic reconciliation of tenants stuck between lifecycle states.

use crate::control::ControlPlane;
use crate::error::TenantError;
use crate::provisioner::ReconcileOutcome;
use crate::store::TenantFilter;
use crate::tenant::{LifecycleState, MigrationStatus, Tenant};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending tenants that finished onboarding.
    pub onboarded: usize,
    /// Provisioned tenants brought to the baseline.
    pub migrated: usize,
    /// Interrupted migration runs carried to their target.
    pub resumed: usize,
    pub rolled_back: usize,
    /// Tenants still stuck after this pass.
    pub errors: usize,
}

/// Background process that resumes interrupted work after a crash or an
/// abandoned request.
pub struct ReconciliationSweep {
    control: Arc<ControlPlane>,
    interval: Duration,
}

impl ReconciliationSweep {
    pub fn new(control: Arc<ControlPlane>, interval: Duration) -> Self {
        Self { control, interval }
    }

    /// One pass over every tenant in an intermediate state.
    pub async fn sweep_once(&self) -> Result<SweepReport, TenantError> {
        let registry = self.control.registry();
        let mut report = SweepReport::default();

        let pending = registry
            .list(&TenantFilter::in_states(&[LifecycleState::Pending]).active_only())
            .await?;
        for tenant in pending {
            match self.control.onboard(&tenant.id).await {
                Ok(_) => report.onboarded += 1,
                Err(err) => note_failure(&tenant, "onboard", &err, &mut report),
            }
        }

        let provisioned = registry
            .list(&TenantFilter::in_states(&[LifecycleState::Provisioned]).active_only())
            .await?;
        let baseline = self.control.baseline();
        for tenant in provisioned {
            match self.control.migrate(&tenant.id, Some(baseline)).await {
                Ok(outcome) if outcome.failed_step.is_none() => report.migrated += 1,
                Ok(outcome) => {
                    debug!(tenant_id = %tenant.id, step = ?outcome.failed_step, "Baseline migration failed");
                    report.errors += 1;
                }
                Err(err) => note_failure(&tenant, "migrate", &err, &mut report),
            }
        }

        // A run whose worker died leaves the status in progress. Taking the
        // lease fails while the worker is alive, so only abandoned runs resume.
        let interrupted = registry
            .list(&TenantFilter::in_states(&[LifecycleState::Migrated, LifecycleState::Failed]).active_only())
            .await?;
        for tenant in interrupted
            .iter()
            .filter(|t| t.migration_status == MigrationStatus::InProgress && t.is_provisioned())
        {
            let target = tenant
                .migration_target
                .unwrap_or(baseline)
                .max(tenant.migration_version);
            match self.control.migrate(&tenant.id, Some(target)).await {
                Ok(outcome) if outcome.failed_step.is_none() => report.resumed += 1,
                Ok(outcome) => {
                    debug!(tenant_id = %tenant.id, step = ?outcome.failed_step, "Resumed migration failed");
                    report.errors += 1;
                }
                Err(err) => note_failure(tenant, "resume_migration", &err, &mut report),
            }
        }

        let failed = registry
            .list(&TenantFilter::in_states(&[LifecycleState::Failed]))
            .await?;
        for tenant in failed.iter().filter(|t| !t.is_provisioned()) {
            match self.control.provisioner().reconcile(&tenant.id).await {
                Ok(ReconcileOutcome::RolledBack { .. }) => report.rolled_back += 1,
                Ok(_) => {}
                Err(err) => note_failure(tenant, "roll_back", &err, &mut report),
            }
        }

        if report != SweepReport::default() {
            info!(
                onboarded = report.onboarded,
                migrated = report.migrated,
                resumed = report.resumed,
                rolled_back = report.rolled_back,
                errors = report.errors,
                "Reconciliation sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweep on the configured interval until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Reconciliation sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(err) = self.sweep_once().await {
                warn!(error = %err, "Reconciliation sweep aborted");
            }
        }
        info!("Reconciliation sweep stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn note_failure(tenant: &Tenant, action: &str, err: &TenantError, report: &mut SweepReport) {
    // another worker holds it; not a failure of this pass
    if matches!(err, TenantError::MigrationInProgress(_)) {
        return;
    }
    warn!(tenant_id = %tenant.id, action, code = err.code(), error = %err, "Reconciliation incomplete");
    report.errors += 1;
}
