//! Dispatch loop between the bus channel and the capture manager.
//!
//! Routing and frame appends run inline, in channel order. Triggers and
//! finalize work go to a [`TaskTracker`] so one slow device never stalls
//! the others.

use crate::error::CaptureError;
use crate::router::{classify, motion_detected, BusMessage, MessageKind};
use crate::session_manager::{CaptureManager, FinalizeOutcome, TriggerOutcome};
use crate::session_table::{AppendOutcome, ClosingSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    manager: Arc<CaptureManager>,
    namespace: String,
    sweep_interval: Duration,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(manager: Arc<CaptureManager>, namespace: impl Into<String>, sweep_interval: Duration) -> Self {
        Self {
            manager,
            namespace: namespace.into(),
            sweep_interval,
            tracker: TaskTracker::new(),
        }
    }

    /// Consume the channel until every sender is gone, then wait for the
    /// spawned trigger and finalize tasks.
    pub async fn run(self, mut rx: mpsc::Receiver<BusMessage>) {
        info!(namespace = %self.namespace, "Dispatcher started");

        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.dispatch(message),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Dispatcher stopped");
    }

    fn dispatch(&self, message: BusMessage) {
        let route = match classify(&message.topic, &self.namespace) {
            Ok(route) => route,
            Err(e) => {
                log_failure(&e, "Dropping message");
                return;
            }
        };

        match route.kind {
            MessageKind::Motion => {
                if !motion_detected(&message.payload) {
                    debug!(device_id = %route.device_id, "Motion payload without detection");
                    return;
                }
                let manager = self.manager.clone();
                self.tracker.spawn(async move {
                    match manager.handle_trigger(&route.device_id).await {
                        Ok(TriggerOutcome::Opened { motion_event_id }) => {
                            debug!(device_id = %route.device_id, motion_event_id, "Trigger accepted");
                        }
                        Ok(TriggerOutcome::AlreadyActive) => {}
                        Err(e) => log_failure(&e, "Trigger failed"),
                    }
                });
            }
            MessageKind::Stream => {
                match self.manager.accept_frame(&route.device_id, &message.payload) {
                    Ok(AppendOutcome::Complete(closing)) => self.spawn_finish(closing),
                    Ok(_) => {}
                    Err(e) => log_failure(&e, "Dropping frame"),
                }
            }
        }
    }

    fn sweep(&self) {
        for closing in self.manager.expire_stale() {
            debug!(
                device_id = %closing.session().device_id(),
                frames = closing.frame_count(),
                "Closing stalled session"
            );
            self.spawn_finish(closing);
        }
    }

    fn spawn_finish(&self, closing: ClosingSession) {
        let manager = self.manager.clone();
        self.tracker.spawn(async move {
            match manager.finish(closing).await {
                Ok(FinalizeOutcome::Committed(video)) => {
                    debug!(video_id = video.video_id, filename = %video.filename, "Finalize committed");
                }
                Ok(FinalizeOutcome::Aborted { .. }) => {}
                Err(e) => log_failure(&e, "Finalize failed"),
            }
        });
    }
}

fn log_failure(err: &CaptureError, context: &str) {
    if err.is_noise() {
        warn!(error = %err, "{}", context);
    } else {
        error!(error = %err, "{}", context);
    }
}
