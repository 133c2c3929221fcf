//! Record-level change fetching across all registered zones.

use crate::classify::{FetchOutcome, RecoveryReason};
use crate::context::{SyncContext, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::transport::CloudTransport;
use cloudsync_protocol::{
    ChangeToken, RecordId, RemoteError, RemoteRecord, ZoneChangeEvent, ZoneChangesRequest,
    ZoneFetchOptions, ZoneId,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a fetch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Zones the database-level fetch reported as changed.
    pub changed_zones: usize,
    /// Zone completions received without error, over all passes.
    pub zones_fetched: usize,
    /// Upserts applied to collaborators.
    pub records_applied: usize,
    /// Tombstones applied to collaborators.
    pub tombstones_applied: usize,
    /// Records no collaborator claimed.
    pub unroutable: usize,
    /// Zone fetch passes run, including automatic reruns.
    pub passes: usize,
}

/// Attributes a collaborator error to its zone.
fn apply_failure(zone: &ZoneId, error: SyncError) -> SyncError {
    match error {
        SyncError::Apply { .. } => error,
        other => SyncError::apply(zone, other.to_string()),
    }
}

/// When to rerun a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rerun {
    Immediately,
    After(Duration),
}

impl Rerun {
    fn merge(self, other: Rerun) -> Rerun {
        match (self, other) {
            (Rerun::After(a), Rerun::After(b)) => Rerun::After(a.max(b)),
            (Rerun::After(d), Rerun::Immediately) | (Rerun::Immediately, Rerun::After(d)) => {
                Rerun::After(d)
            }
            (Rerun::Immediately, Rerun::Immediately) => Rerun::Immediately,
        }
    }
}

/// How one pass ended.
enum PassEnd {
    Finished(SyncResult<()>),
    Rerun(Rerun, RemoteError),
}

/// Bookkeeping of a single pass.
#[derive(Default)]
struct PassState {
    /// Set when a zone asked for a rerun; suppresses reporting this pass's
    /// errors because the rerun reports instead.
    retrying: Option<(Rerun, RemoteError)>,
    /// Zones whose tokens must not advance any further this pass.
    failed_zones: HashSet<ZoneId>,
    /// First zone-scoped failure.
    failure: Option<SyncError>,
}

impl PassState {
    fn request_rerun(&mut self, rerun: Rerun, cause: RemoteError) {
        self.retrying = Some(match self.retrying.take() {
            Some((previous, _)) => (previous.merge(rerun), cause),
            None => (rerun, cause),
        });
    }

    fn fail(&mut self, zone: &ZoneId, error: SyncError) {
        self.failed_zones.insert(zone.clone());
        self.failure.get_or_insert(error);
    }

    fn is_failed(&self, zone: &ZoneId) -> bool {
        self.failed_zones.contains(zone)
    }
}

/// Per-zone reconciliation.
///
/// One request covers every registered zone, each resuming from its own
/// token. Records are routed to collaborators as they stream in, tokens
/// are persisted at every checkpoint, and relationship resolution runs
/// once on every collaborator after the last delivery of the pass.
pub(crate) struct ZoneChangeFetcher<T> {
    ctx: Arc<SyncContext<T>>,
}

impl<T: CloudTransport> ZoneChangeFetcher<T> {
    pub(crate) fn new(ctx: Arc<SyncContext<T>>) -> Self {
        Self { ctx }
    }

    /// Fetches every zone until a terminal outcome.
    ///
    /// A zone that asks for a retry or reports an expired token causes
    /// the whole pass to be rerun; only the final pass decides the result.
    pub(crate) async fn fetch_all_zones(&self) -> SyncResult<FetchSummary> {
        let ctx = &self.ctx;
        let mut budget = ctx.config.retry.budget();
        let mut summary = FetchSummary::default();

        loop {
            ctx.liveness.check()?;
            summary.passes += 1;

            match self.run_pass(&mut summary).await? {
                PassEnd::Finished(result) => return result.map(|()| summary),
                PassEnd::Rerun(Rerun::Immediately, cause) => {
                    budget.spend(&cause)?;
                    info!(error = %cause, "rerunning zone fetch");
                }
                PassEnd::Rerun(Rerun::After(delay), cause) => {
                    budget.spend(&cause)?;
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "zone fetch failed, retrying"
                    );
                    ctx.retry_after(delay).await?;
                }
            }
        }
    }

    async fn run_pass(&self, summary: &mut FetchSummary) -> SyncResult<PassEnd> {
        let ctx = &self.ctx;
        ctx.set_state(SyncState::FetchingZones);

        let mut zones = Vec::with_capacity(ctx.registry.len());
        for zone_id in ctx.registry.zone_ids() {
            let since = ctx.tokens.zone_token(&zone_id)?;
            zones.push(ZoneFetchOptions { zone_id, since });
        }
        if zones.is_empty() {
            debug!("no zones registered, nothing to fetch");
            return Ok(PassEnd::Finished(Ok(())));
        }

        debug!(zones = zones.len(), "fetching zone changes");
        let mut events = ctx.transport.fetch_zone_changes(ZoneChangesRequest {
            zones,
            fetch_all_changes: true,
            quality_of_service: ctx.config.quality_of_service,
        });

        let mut pass = PassState::default();
        while let Some(event) = events.recv().await {
            ctx.liveness.check()?;
            match event {
                ZoneChangeEvent::TokenCheckpoint { zone_id, token } => {
                    self.persist_token(&mut pass, &zone_id, &token).await;
                }
                ZoneChangeEvent::RecordChanged(record) => {
                    self.apply_upsert(&mut pass, summary, &record);
                }
                ZoneChangeEvent::RecordDeleted {
                    record_id, zone_id, ..
                } => {
                    self.apply_tombstone(&mut pass, summary, &zone_id, &record_id);
                }
                ZoneChangeEvent::ZoneCompleted {
                    zone_id,
                    token,
                    error,
                } => {
                    self.complete_zone(&mut pass, summary, &zone_id, token, error)
                        .await;
                }
                ZoneChangeEvent::Completed { error } => {
                    self.resolve_relationships();
                    return Ok(self.finish(pass, error));
                }
            }
        }

        self.resolve_relationships();
        Err(SyncError::Remote(RemoteError::Internal(
            "zone change stream ended without completion".into(),
        )))
    }

    async fn persist_token(&self, pass: &mut PassState, zone: &ZoneId, token: &ChangeToken) {
        if pass.is_failed(zone) {
            return;
        }
        let (zone_id, token) = (zone.clone(), token.clone());
        let written = self
            .ctx
            .write_tokens(move |tokens| tokens.set_zone_token(&zone_id, Some(&token)))
            .await;
        if let Err(e) = written {
            warn!(zone = %zone, error = %e, "persisting zone token failed");
            pass.fail(zone, e);
        }
    }

    fn apply_upsert(
        &self,
        pass: &mut PassState,
        summary: &mut FetchSummary,
        record: &RemoteRecord,
    ) {
        let Some(entry) = self.ctx.registry.by_record_type(&record.record_type) else {
            warn!(
                record_type = %record.record_type,
                record = %record.record_id,
                "no collaborator for record type, ignoring"
            );
            summary.unroutable += 1;
            return;
        };
        if pass.is_failed(&record.zone_id) {
            return;
        }

        match entry.object().apply_upsert(record) {
            Ok(()) => {
                summary.records_applied += 1;
                self.ctx.record(|stats| stats.records_applied += 1);
            }
            Err(e) => {
                warn!(zone = %record.zone_id, record = %record.record_id, error = %e, "applying upsert failed");
                pass.fail(&record.zone_id, apply_failure(&record.zone_id, e));
            }
        }
    }

    fn apply_tombstone(
        &self,
        pass: &mut PassState,
        summary: &mut FetchSummary,
        zone: &ZoneId,
        record_id: &RecordId,
    ) {
        let Some(entry) = self.ctx.registry.by_zone(zone) else {
            warn!(zone = %zone, record = %record_id, "no collaborator for zone, ignoring deletion");
            summary.unroutable += 1;
            return;
        };
        if pass.is_failed(zone) {
            return;
        }

        match entry.object().apply_tombstone(record_id) {
            Ok(()) => {
                summary.tombstones_applied += 1;
                self.ctx.record(|stats| stats.tombstones_applied += 1);
            }
            Err(e) => {
                warn!(zone = %zone, record = %record_id, error = %e, "applying tombstone failed");
                pass.fail(zone, apply_failure(zone, e));
            }
        }
    }

    async fn complete_zone(
        &self,
        pass: &mut PassState,
        summary: &mut FetchSummary,
        zone: &ZoneId,
        token: Option<ChangeToken>,
        error: Option<RemoteError>,
    ) {
        match self.ctx.classifier.classify(error.as_ref()) {
            FetchOutcome::Success => {
                if let Some(token) = token {
                    self.persist_token(pass, zone, &token).await;
                }
                if !pass.is_failed(zone) {
                    summary.zones_fetched += 1;
                    debug!(zone = %zone, "zone up to date");
                }
            }
            FetchOutcome::Retry(delay) => {
                let cause = error.unwrap_or(RemoteError::NetworkFailure);
                pass.request_rerun(Rerun::After(delay), cause);
            }
            FetchOutcome::Recoverable {
                reason: RecoveryReason::CursorExpired,
                error,
            } => {
                info!(zone = %zone, "zone change token expired, refetching zone from scratch");
                self.ctx.record(|stats| stats.cursor_resets += 1);
                let zone_id = zone.clone();
                let cleared = self
                    .ctx
                    .write_tokens(move |tokens| tokens.set_zone_token(&zone_id, None))
                    .await;
                if let Err(e) = cleared {
                    pass.fail(zone, e);
                }
                pass.request_rerun(Rerun::Immediately, error);
            }
            FetchOutcome::Recoverable { error, .. } | FetchOutcome::Fatal(error) => {
                if matches!(error, RemoteError::ZoneNotFound | RemoteError::UserDeletedZone) {
                    if let Err(e) = self.ctx.forget_remote_zone(zone).await {
                        warn!(zone = %zone, error = %e, "forgetting deleted zone failed");
                    }
                }
                warn!(zone = %zone, error = %error, "zone fetch failed");
                pass.fail(zone, SyncError::Remote(error));
            }
        }
    }

    fn resolve_relationships(&self) {
        for entry in self.ctx.registry.iter() {
            entry.object().resolve_pending_relationships();
        }
    }

    fn finish(&self, mut pass: PassState, error: Option<RemoteError>) -> PassEnd {
        if let Some(error) = &error {
            if let FetchOutcome::Retry(delay) = self.ctx.classifier.classify(Some(error)) {
                pass.request_rerun(Rerun::After(delay), error.clone());
            }
        }
        if let Some((rerun, cause)) = pass.retrying {
            return PassEnd::Rerun(rerun, cause);
        }

        match (error, pass.failure) {
            (Some(error), _) => PassEnd::Finished(Err(SyncError::Remote(error))),
            (None, Some(failure)) => PassEnd::Finished(Err(failure)),
            (None, None) => PassEnd::Finished(Ok(())),
        }
    }
}
