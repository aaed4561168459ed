// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bus consumers: the task workers and the expiry sweeper.

use crate::AppState;
use chrono::Utc;
use refbase_bus::Delivery;
use refbase_core::tasks::{
    DedupPayload, ImportResultsPayload, PercolatePayload, ProcessBatchPayload, DEDUP_REFERENCE,
    IMPORT_ROBOT_RESULTS, PERCOLATE_CHANGES, PROCESS_IMPORT_BATCH, REPAIR_INDEX,
};
use refbase_core::ReferenceWithChangeset;
use refbase_error::{RepoError, RepoResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

fn payload<T: serde::de::DeserializeOwned>(delivery: &Delivery) -> RepoResult<T> {
    serde_json::from_value(delivery.task.payload.clone()).map_err(|e| RepoError::Bus {
        detail: format!("malformed {} payload: {e}", delivery.task.kind),
        lock_lost: false,
    })
}

/// Handle one delivered task.
///
/// The per-reference lifecycle chain lives here: the dedup worker publishes
/// the percolation continuation after the decision and projection land.
pub async fn handle_task(state: &AppState, delivery: &Delivery) -> RepoResult<()> {
    match delivery.task.kind.as_str() {
        PROCESS_IMPORT_BATCH => {
            let p: ProcessBatchPayload = payload(delivery)?;
            state
                .batch_processor
                .process_with_retries(p.import_batch_id, p.remaining_retries)
                .await?;
            Ok(())
        }
        DEDUP_REFERENCE => {
            let p: DedupPayload = payload(delivery)?;
            // The reference may have been discarded as an exact duplicate by
            // an earlier chain; nothing left to do then.
            let Ok(reference) = state.store.get_reference(p.reference_id).await else {
                debug!(
                    target: "refbase.api.worker",
                    reference_id = %p.reference_id,
                    "reference gone before deduplication"
                );
                return Ok(());
            };
            let outcome = state.dedup.evaluate(&reference).await?;
            if !outcome.discarded {
                state
                    .bus
                    .publish(
                        refbase_bus::Task::new(
                            PERCOLATE_CHANGES,
                            serde_json::to_value(PercolatePayload {
                                reference_id: p.reference_id,
                                changeset: p.changeset,
                            })
                            .map_err(|e| RepoError::internal(e.to_string()))?,
                        )
                        .with_trace(delivery.task.trace.clone()),
                    )
                    .await;
            }
            Ok(())
        }
        PERCOLATE_CHANGES => {
            let p: PercolatePayload = payload(delivery)?;
            let Ok(reference) = state.store.get_reference(p.reference_id).await else {
                return Ok(());
            };
            state
                .automations
                .on_changes(&[ReferenceWithChangeset {
                    reference,
                    changeset: p.changeset,
                }])
                .await?;
            Ok(())
        }
        IMPORT_ROBOT_RESULTS => {
            let p: ImportResultsPayload = payload(delivery)?;
            state
                .dispatch
                .import_results(p.robot_enhancement_batch_id)
                .await
        }
        REPAIR_INDEX => {
            state.index_manager.repair().await?;
            Ok(())
        }
        other => {
            warn!(target: "refbase.api.worker", kind = other, "unknown task kind");
            Ok(())
        }
    }
}

/// Consume tasks until shutdown is signalled.
///
/// Cancellation is cooperative: the loop checks the shutdown signal between
/// tasks and releases message locks without acking when asked to stop.
pub async fn run_worker(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let delivery = match state.bus.receive().await {
            Some(delivery) => delivery,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
        };
        debug!(
            target: "refbase.api.worker",
            kind = %delivery.task.kind,
            attempt = delivery.attempt,
            "handling task"
        );
        if *shutdown.borrow() {
            let _ = state.bus.abandon(delivery.task.id).await;
            return;
        }
        match handle_task(&state, &delivery).await {
            Ok(()) => {
                let _ = state.bus.ack(delivery.task.id).await;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    target: "refbase.api.worker",
                    kind = %delivery.task.kind,
                    error = %err,
                    "transient failure, releasing for redelivery"
                );
                let _ = state.bus.abandon(delivery.task.id).await;
            }
            Err(err) => {
                error!(
                    target: "refbase.api.worker",
                    kind = %delivery.task.kind,
                    error = %err,
                    "task failed terminally"
                );
                // The store committed before the search write; drift is
                // repaired, never rolled back.
                if matches!(err, RepoError::Projection { .. }) {
                    state.index_manager.enqueue_repair().await;
                }
                let _ = state.bus.ack(delivery.task.id).await;
            }
        }
    }
}

/// Periodically expire lapsed leases and reclaim lapsed message locks.
pub async fn run_sweeper(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.dispatch.sweep_interval;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        if *shutdown.borrow() {
            return;
        }
        let now = Utc::now();
        if let Err(err) = state.dispatch.sweep(now).await {
            error!(target: "refbase.api.sweeper", error = %err, "sweep failed");
        }
        state.bus.reap_expired_at(now).await;
    }
}
