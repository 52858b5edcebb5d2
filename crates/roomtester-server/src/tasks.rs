//! Periodic background tasks
//!
//! - Position report at `POSITION_REPORT_HZ` while playing
//! - Metering at `METER_RATE_HZ` on the blocking pool, delivering events to
//!   subscribers

use crate::messages::ServerMessage;
use crate::{broadcast_state, AppState};
use roomtester_core::{MeterEvent, MeteringScheduler, SubscriberId};
use std::sync::Arc;
use std::time::Duration;

/// Broadcast the playback position while playing
pub async fn position_report_loop(state: AppState) {
    let period = Duration::from_secs_f64(1.0 / roomtester_core::POSITION_REPORT_HZ as f64);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if let Some(status) = state.transport().refresh_reported_position() {
            broadcast_state(&state.ws_tx, status);
        }
    }
}

/// Measure the live position and push results to subscribers
pub async fn metering_loop(state: AppState) {
    let period = Duration::from_secs_f64(1.0 / roomtester_core::METER_RATE_HZ as f64);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut scheduler = MeteringScheduler::new(Arc::clone(state.transport()));

    loop {
        interval.tick().await;
        scheduler = metering_step(&state, scheduler).await;
    }
}

/// Run one pass on the blocking pool and deliver its events
///
/// The pass holds the metering lock through the FFTs and any history
/// snapshot, so it stays off the async workers.
pub async fn metering_step(state: &AppState, scheduler: MeteringScheduler) -> MeteringScheduler {
    let pass_state = state.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut scheduler = scheduler;
        let events = run_metering_pass(&pass_state, &mut scheduler);
        (scheduler, events)
    })
    .await;

    match result {
        Ok((scheduler, events)) => {
            deliver(state, events);
            scheduler
        }
        Err(e) => {
            tracing::error!("Metering pass panicked: {}", e);
            MeteringScheduler::new(Arc::clone(state.transport()))
        }
    }
}

/// One scheduler tick under the metering lock
pub fn run_metering_pass(
    state: &AppState,
    scheduler: &mut MeteringScheduler,
) -> Vec<(SubscriberId, MeterEvent)> {
    match state.metering.lock() {
        Ok(mut metering) => scheduler.tick(&mut metering),
        Err(_) => {
            tracing::warn!("Metering state poisoned; skipping tick");
            Vec::new()
        }
    }
}

fn deliver(state: &AppState, events: Vec<(SubscriberId, MeterEvent)>) {
    for (subscriber, event) in events {
        let Some(json) = ServerMessage::Meter(event).to_json() else {
            continue;
        };
        if !state.clients.send(subscriber, json) {
            tracing::debug!(subscriber, "Dropped meter event");
        }
    }
}
