//! Per-run fan-out of log and status events.
//!
//! Every publish and every subscribe happens under the same lock, so a
//! subscriber joining mid-run gets the buffered logs and the current
//! snapshot as backfill and then exactly the events published after it
//! joined: nothing skipped, nothing twice.
//!
//! Live delivery uses one bounded channel per subscriber. A subscriber that
//! falls a full channel behind is detached; once it has drained what it
//! already received, its [`Subscription`] reattaches and is backfilled with
//! the log lines after the last one it saw plus the current snapshot.
//! Intermediate `run` snapshots it missed are superseded by that snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, Stream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::domain::{LogEntry, Run, RunStatus, StreamEvent};

/// Fan-out channel for one run
#[derive(Debug)]
pub struct EventBroadcaster {
    run_id: i64,
    capacity: usize,
    state: Mutex<BroadcastState>,
}

#[derive(Debug)]
struct BroadcastState {
    logs: Vec<LogEntry>,
    snapshot: Run,
    /// `done` or `deleted`, once published
    finale: Option<StreamEvent>,
    subscribers: HashMap<u64, mpsc::Sender<StreamEvent>>,
    next_subscriber: u64,
}

impl EventBroadcaster {
    /// Create a broadcaster seeded with the run's initial snapshot
    pub fn new(run: Run, capacity: usize) -> Self {
        Self {
            run_id: run.id,
            capacity: capacity.max(1),
            state: Mutex::new(BroadcastState {
                logs: Vec::new(),
                snapshot: run,
                finale: None,
                subscribers: HashMap::new(),
                next_subscriber: 0,
            }),
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    fn state(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the stream: backfill first, then live events
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.attach(0)
    }

    /// Join with a backfill of the log lines after `after_log_id`
    fn attach(self: &Arc<Self>, after_log_id: i64) -> Subscription {
        let mut state = self.state();

        let start = state.logs.partition_point(|entry| entry.id <= after_log_id);
        let mut backfill: VecDeque<StreamEvent> = state.logs[start..]
            .iter()
            .cloned()
            .map(StreamEvent::Log)
            .collect();
        backfill.push_back(StreamEvent::Run(state.snapshot.clone()));

        if let Some(ref finale) = state.finale {
            backfill.push_back(finale.clone());
            return Subscription::new(backfill, None, None, after_log_id);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, tx);
        debug!(run_id = self.run_id, subscriber = id, after_log_id, "Subscriber joined");

        Subscription::new(
            backfill,
            Some(rx),
            Some((Arc::clone(self), id)),
            after_log_id,
        )
    }

    fn unsubscribe(&self, id: u64) {
        if self.state().subscribers.remove(&id).is_some() {
            debug!(run_id = self.run_id, subscriber = id, "Subscriber left");
        }
    }

    /// Live subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Buffer and deliver a log line. Ignored once closed.
    pub fn publish_log(&self, entry: LogEntry) -> bool {
        let mut state = self.state();
        if state.finale.is_some() {
            return false;
        }

        state.logs.push(entry.clone());
        self.fan_out(&mut state, StreamEvent::Log(entry));
        true
    }

    /// Replace the snapshot and deliver it. Ignored once closed.
    pub fn publish_run(&self, run: Run) -> bool {
        let mut state = self.state();
        if state.finale.is_some() {
            return false;
        }

        state.snapshot = run.clone();
        self.fan_out(&mut state, StreamEvent::Run(run));
        true
    }

    /// Publish the single `done` event and close
    pub fn publish_done(&self, status: RunStatus) -> bool {
        self.close(StreamEvent::done(self.run_id, status))
    }

    /// Publish `deleted` and close.
    ///
    /// Supersedes an earlier `done`: subscribers joining afterwards see
    /// `deleted` as the final event instead.
    pub fn publish_deleted(&self) -> bool {
        self.close(StreamEvent::deleted(self.run_id))
    }

    fn close(&self, finale: StreamEvent) -> bool {
        let mut state = self.state();
        match state.finale {
            None => {}
            Some(StreamEvent::Done(_)) if matches!(finale, StreamEvent::Deleted(_)) => {}
            Some(_) => return false,
        }

        self.fan_out(&mut state, finale.clone());
        state.finale = Some(finale);
        // Dropping the senders ends every stream once it drains.
        state.subscribers.clear();
        true
    }

    fn fan_out(&self, state: &mut BroadcastState, event: StreamEvent) {
        let run_id = self.run_id;
        state
            .subscribers
            .retain(|id, tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(run_id, subscriber = *id, "Subscriber fell behind, detaching it for a resync");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(run_id, subscriber = *id, "Pruned disconnected subscriber");
                    false
                }
            });
    }
}

/// One subscriber's view of a run's event stream.
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    backfill: VecDeque<StreamEvent>,
    receiver: Option<mpsc::Receiver<StreamEvent>>,
    membership: Option<(Arc<EventBroadcaster>, u64)>,
    /// Id of the last log line handed out
    last_log_id: i64,
    /// `done` or `deleted` has been handed out
    finished: bool,
}

impl Subscription {
    fn new(
        backfill: VecDeque<StreamEvent>,
        receiver: Option<mpsc::Receiver<StreamEvent>>,
        membership: Option<(Arc<EventBroadcaster>, u64)>,
        last_log_id: i64,
    ) -> Self {
        Self {
            backfill,
            receiver,
            membership,
            last_log_id,
            finished: false,
        }
    }

    /// A stream that has no live part: the given history, then the end.
    ///
    /// Used for runs whose broadcaster was already released.
    pub fn detached(logs: Vec<LogEntry>, run: Run) -> Self {
        let finale = run
            .status
            .is_terminal()
            .then(|| StreamEvent::done(run.id, run.status));

        let mut backfill: VecDeque<StreamEvent> = logs.into_iter().map(StreamEvent::Log).collect();
        backfill.push_back(StreamEvent::Run(run));
        backfill.extend(finale);

        Self::new(backfill, None, None, 0)
    }

    /// Events still waiting in the backfill
    pub fn pending_backfill(&self) -> usize {
        self.backfill.len()
    }

    /// Next event, or `None` when the stream has ended
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.backfill.pop_front() {
                return Some(self.hand_out(event));
            }

            let received = self.receiver.as_mut()?.recv().await;
            match received {
                Some(event) => return Some(self.hand_out(event)),
                None if self.finished => {
                    self.receiver = None;
                    return None;
                }
                // Detached for falling behind
                None => self.reattach(),
            }
        }
    }

    fn hand_out(&mut self, event: StreamEvent) -> StreamEvent {
        match event {
            StreamEvent::Log(ref entry) => self.last_log_id = entry.id,
            ref event if event.is_final() => self.finished = true,
            _ => {}
        }
        event
    }

    fn reattach(&mut self) {
        self.receiver = None;
        let Some((broadcaster, id)) = self.membership.take() else {
            return;
        };
        broadcaster.unsubscribe(id);

        let mut resumed = broadcaster.attach(self.last_log_id);
        debug!(
            run_id = broadcaster.run_id(),
            after_log_id = self.last_log_id,
            "Subscriber resynced"
        );
        self.backfill = std::mem::take(&mut resumed.backfill);
        self.receiver = resumed.receiver.take();
        self.membership = resumed.membership.take();
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        stream::unfold(self, |mut subscription| async move {
            let event = subscription.next().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some((broadcaster, id)) = self.membership.take() {
            broadcaster.unsubscribe(id);
        }
    }
}
