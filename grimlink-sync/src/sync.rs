//! Batched, rate-limited broadcast of field changes.
//!
//! ```text
//! FieldUpdate ──► DiffAccumulator
//!      │
//!      └──► BurstCoalescer (10ms, trailing) ──► RateLimiter (333ms, leading+trailing) ──► flush
//!                                                                                          │
//!                          BroadcastClient::broadcast_delta ◄── take() ◄───────────────────┘
//! ```
//!
//! The coalescer groups a burst of writes into one settle; the limiter then
//! keeps the remote under three calls per second. An optional third gate
//! uploads the whole state as the broadcaster configuration.
//!
//! Everything runs inside [`BatchSynchronizer::run`], which owns all state.
//! HTTP calls are spawned so accumulation continues while they are in flight.

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

use crate::broadcast::{BroadcastClient, BroadcasterId, Delivery};
use crate::diff::{DiffAccumulator, FieldUpdate, StateDiff};
use crate::protocol::ViewerMessage;
use crate::throttle::{sleep_until, BurstCoalescer, Gate, RateLimiter, Trigger};

/// Consecutive rejected full-state uploads re-armed before giving up.
pub const FULL_STATE_RETRY_LIMIT: u32 = 3;

/// Gate timings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Outer trailing-only window.
    pub burst_window: Duration,
    /// Minimum spacing between delta broadcasts.
    pub flush_spacing: Duration,
    /// Minimum spacing between full-state uploads; `None` disables them.
    pub full_state_spacing: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            burst_window: Duration::from_millis(10),
            flush_spacing: Duration::from_millis(1000 / 3),
            full_state_spacing: None,
        }
    }
}

/// Canonical full state and its upload gate.
#[derive(Debug)]
struct FullStateSync {
    gate: RateLimiter,
    latest: StateDiff,
    /// Changed since the last upload started.
    dirty: bool,
    retries: u32,
}

pub struct BatchSynchronizer {
    accumulator: DiffAccumulator,
    coalescer: BurstCoalescer,
    limiter: RateLimiter,
    full_state: Option<FullStateSync>,
    client: BroadcastClient,
    identity: watch::Receiver<Option<BroadcasterId>>,
    outcomes_tx: mpsc::UnboundedSender<Delivery>,
    outcomes_rx: mpsc::UnboundedReceiver<Delivery>,
}

impl BatchSynchronizer {
    pub fn new(
        config: SyncConfig,
        client: BroadcastClient,
        identity: watch::Receiver<Option<BroadcasterId>>,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            accumulator: DiffAccumulator::new(),
            coalescer: BurstCoalescer::new(config.burst_window),
            limiter: RateLimiter::new(config.flush_spacing),
            full_state: config.full_state_spacing.map(|spacing| FullStateSync {
                gate: RateLimiter::new(spacing),
                latest: StateDiff::default(),
                dirty: false,
                retries: 0,
            }),
            client,
            identity,
            outcomes_tx,
            outcomes_rx,
        }
    }

    /// Drive the synchronizer until the update channel closes.
    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<FieldUpdate>) {
        let mut identity_open = true;
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                update = updates.recv() => match update {
                    Some(update) => self.update(update, Instant::now()),
                    None => break,
                },
                changed = self.identity.changed(), if identity_open => {
                    if changed.is_err() {
                        identity_open = false;
                        continue;
                    }
                    self.identity_changed(Instant::now());
                }
                Some(outcome) = self.outcomes_rx.recv() => {
                    self.full_state_outcome(outcome, Instant::now());
                }
                _ = sleep_until(deadline) => self.tick(Instant::now()),
            }
        }
        log::debug!(
            "Synchronizer stopped, {} fields unsent",
            self.accumulator.pending().fields().len()
        );
    }

    /// Record a field change and request a flush.
    pub fn update(&mut self, update: FieldUpdate, now: Instant) {
        let upload = self.full_state.as_mut().is_some_and(|full| {
            full.latest.apply(update.clone());
            full.dirty = true;
            full.gate.call(now) == Trigger::Fire
        });
        if upload {
            self.upload_full_state();
        }
        self.accumulator.update(update);
        self.request_flush(now);
    }

    fn request_flush(&mut self, now: Instant) {
        if self.coalescer.call(now) == Trigger::Fire {
            self.settle(now);
        }
    }

    /// The burst is over: offer a flush to the rate limiter.
    fn settle(&mut self, now: Instant) {
        if self.limiter.call(now) == Trigger::Fire {
            self.flush();
        }
    }

    fn identity_changed(&mut self, now: Instant) {
        let Some(broadcaster) = self.identity.borrow_and_update().clone() else {
            log::info!("Broadcaster signed out, broadcasting paused");
            return;
        };
        log::info!("Broadcasting for {broadcaster}");

        if !self.accumulator.is_empty() {
            self.request_flush(now);
        }
        let upload = self
            .full_state
            .as_mut()
            .is_some_and(|full| full.dirty && full.gate.call(now) == Trigger::Fire);
        if upload {
            self.upload_full_state();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.coalescer.deadline(),
            self.limiter.deadline(),
            self.full_state.as_ref().and_then(|full| full.gate.deadline()),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every gate whose deadline has passed.
    pub fn tick(&mut self, now: Instant) {
        if self.coalescer.expire(now) {
            self.settle(now);
        }
        if self.limiter.expire(now) {
            self.flush();
        }
        let full_due = self
            .full_state
            .as_mut()
            .is_some_and(|full| full.gate.expire(now));
        if full_due {
            self.upload_full_state();
        }
    }

    fn broadcaster(&self) -> Option<BroadcasterId> {
        self.identity.borrow().clone()
    }

    /// Ship the pending diff. Without an identity the diff is kept.
    fn flush(&mut self) {
        let Some(broadcaster) = self.broadcaster() else {
            log::info!(
                "No broadcaster identity, holding {} pending fields",
                self.accumulator.pending().fields().len()
            );
            return;
        };

        let diff = self.accumulator.take();
        if diff.is_empty() {
            log::debug!("Flush with nothing pending");
            return;
        }
        log::debug!("Flushing {:?}", diff.fields());

        let client = self.client.clone();
        tokio::spawn(async move {
            let message = ViewerMessage::BulkUpdateState { payload: diff };
            client.broadcast_delta(&broadcaster, &message).await;
        });
    }

    fn upload_full_state(&mut self) {
        let Some(broadcaster) = self.broadcaster() else {
            return;
        };
        let Some(full) = &mut self.full_state else {
            return;
        };
        full.dirty = false;
        let snapshot = full.latest.clone();
        log::debug!("Uploading full state {:?}", snapshot.fields());

        let client = self.client.clone();
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let delivery = client.set_full_state(&broadcaster, &snapshot).await;
            let _ = outcomes.send(delivery);
        });
    }

    fn full_state_outcome(&mut self, delivery: Delivery, now: Instant) {
        let Some(full) = &mut self.full_state else {
            return;
        };
        let upload = match delivery {
            Delivery::Conflict | Delivery::RateLimited if full.retries < FULL_STATE_RETRY_LIMIT => {
                full.retries += 1;
                full.dirty = true;
                log::info!(
                    "Retrying full state upload ({}/{FULL_STATE_RETRY_LIMIT})",
                    full.retries
                );
                full.gate.call(now) == Trigger::Fire
            }
            Delivery::Conflict | Delivery::RateLimited => {
                log::warn!(
                    "Full state upload rejected {} times, waiting for next change",
                    full.retries
                );
                full.retries = 0;
                false
            }
            Delivery::Sent | Delivery::Failed => {
                full.retries = 0;
                false
            }
        };
        if upload {
            self.upload_full_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::recording::{ApiCall, RecordingApi};
    use crate::codec;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    struct Harness {
        api: Arc<RecordingApi>,
        updates: mpsc::UnboundedSender<FieldUpdate>,
        identity: watch::Sender<Option<BroadcasterId>>,
        _task: JoinHandle<()>,
    }

    fn start(config: SyncConfig, broadcaster: Option<&str>) -> Harness {
        let api = RecordingApi::new();
        let (identity, identity_rx) = watch::channel(broadcaster.map(BroadcasterId::new));
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let sync = BatchSynchronizer::new(config, BroadcastClient::new(api.clone()), identity_rx);
        Harness {
            api,
            updates,
            identity,
            _task: tokio::spawn(sync.run(updates_rx)),
        }
    }

    fn page(name: &str) -> FieldUpdate {
        FieldUpdate::Page(Some(name.to_string()))
    }

    fn broadcasts(api: &RecordingApi) -> Vec<StateDiff> {
        api.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::PubSub { target, message, .. } if target == "broadcast" => {
                    match codec::decode::<ViewerMessage>(&message).unwrap() {
                        ViewerMessage::BulkUpdateState { payload } => Some(payload),
                        other => panic!("unexpected broadcast {other:?}"),
                    }
                }
                _ => None,
            })
            .collect()
    }

    fn configurations(api: &RecordingApi) -> Vec<StateDiff> {
        api.calls()
            .into_iter()
            .filter_map(|call| match call {
                ApiCall::Configuration { content, .. } => Some(codec::decode(&content).unwrap()),
                _ => None,
            })
            .collect()
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_ships_one_call_with_final_values() {
        let h = start(SyncConfig::default(), Some("42"));

        h.updates.send(page("A")).unwrap();
        h.updates.send(FieldUpdate::Seats(Some(Vec::new()))).unwrap();
        h.updates.send(page("B")).unwrap();
        advance(5).await;
        assert!(h.api.calls().is_empty(), "coalescer must not lead");

        advance(20).await;
        let sent = broadcasts(&h.api);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].page.as_deref(), Some("B"));
        assert_eq!(sent[0].seats, Some(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_unset_sends_nothing_for_field() {
        let h = start(SyncConfig::default(), Some("42"));

        h.updates.send(FieldUpdate::Seats(Some(Vec::new()))).unwrap();
        h.updates.send(FieldUpdate::Seats(None)).unwrap();
        h.updates.send(page("A")).unwrap();
        advance(50).await;

        let sent = broadcasts(&h.api);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].seats.is_none());
        assert_eq!(sent[0].page.as_deref(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_identity_means_no_calls_until_sign_in() {
        let h = start(SyncConfig::default(), None);

        h.updates.send(page("A")).unwrap();
        advance(2000).await;
        assert!(h.api.calls().is_empty());

        h.identity.send_replace(Some(BroadcasterId::new("42")));
        advance(50).await;
        let sent = broadcasts(&h.api);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].page.as_deref(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_to_three_per_second() {
        let h = start(SyncConfig::default(), Some("42"));

        for i in 0..100 {
            h.updates.send(page(&format!("p{i}"))).unwrap();
            advance(10).await;
        }
        advance(1000).await;

        let sent = broadcasts(&h.api);
        assert!(sent.len() >= 3 && sent.len() <= 5, "sent {} broadcasts", sent.len());
        assert_eq!(sent.last().unwrap().page.as_deref(), Some("p99"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_upload_and_retry() {
        let config = SyncConfig {
            full_state_spacing: Some(Duration::from_millis(1000)),
            ..SyncConfig::default()
        };
        let h = start(config, Some("42"));
        h.api.respond_with(&[409]);

        h.updates.send(page("A")).unwrap();
        advance(50).await;
        // first upload conflicted; the retry waits out the spacing
        assert_eq!(configurations(&h.api).len(), 1);

        advance(1000).await;
        let uploads = configurations(&h.api);
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[1].page.as_deref(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_gives_up_after_retry_limit() {
        let config = SyncConfig {
            full_state_spacing: Some(Duration::from_millis(100)),
            ..SyncConfig::default()
        };
        let h = start(config, Some("42"));
        h.api.respond_with(&[429, 429, 429, 429, 429]);

        h.updates.send(page("A")).unwrap();
        advance(2000).await;
        assert_eq!(configurations(&h.api).len(), 1 + FULL_STATE_RETRY_LIMIT as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_state_disabled_by_default() {
        let h = start(SyncConfig::default(), Some("42"));
        h.updates.send(page("A")).unwrap();
        advance(2000).await;
        assert!(configurations(&h.api).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_failures_are_not_retried() {
        let h = start(SyncConfig::default(), Some("42"));
        h.api.respond_with(&[500]);

        h.updates.send(page("A")).unwrap();
        advance(3000).await;
        assert_eq!(broadcasts(&h.api).len(), 1);
    }
}
