//! Capture session table.
//!
//! Maps a device identifier to at most one slot. A slot moves
//! `Opening -> Capturing -> Finalizing` and is removed exactly once, by the
//! guard object that owns the current transition:
//!
//! - [`Reservation`] releases an `Opening` slot unless it was activated;
//! - [`ClosingSession`] releases a `Finalizing` slot when finalize or abort
//!   is done with it.
//!
//! Every operation takes the table lock for a short, non-async critical
//! section, so create-if-absent, append-and-check and remove are atomic.

use crate::directory::DeviceRecord;
use crate::frame_buffer::FrameBuffer;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The live record of one device's in-progress capture.
#[derive(Debug)]
pub struct CaptureSession {
    pub device: DeviceRecord,
    /// Correlation identifier (motion event id)
    pub motion_event_id: i64,
    pub frames: FrameBuffer,
    /// Monotonic start, drives the completion clock
    pub started_at: Instant,
    /// Wall-clock start, used for naming and metadata
    pub started_wall: DateTime<Utc>,
}

impl CaptureSession {
    pub fn new(device: DeviceRecord, motion_event_id: i64, capacity: usize) -> Self {
        Self {
            device,
            motion_event_id,
            frames: FrameBuffer::new(capacity),
            started_at: Instant::now(),
            started_wall: Utc::now(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Buffered frame count reached the target
    TargetReached,
    /// Session outlived target duration plus grace period
    Expired,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::TargetReached => "target_reached",
            CompletionReason::Expired => "expired",
        }
    }
}

/// When a capturing session is considered complete.
#[derive(Debug, Clone, Copy)]
pub struct CompletionPolicy {
    pub target_frames: usize,
    pub max_age: Duration,
}

impl CompletionPolicy {
    pub fn evaluate(&self, session: &CaptureSession, now: Instant) -> Option<CompletionReason> {
        if session.frames.len() >= self.target_frames {
            Some(CompletionReason::TargetReached)
        } else if now.saturating_duration_since(session.started_at) >= self.max_age {
            Some(CompletionReason::Expired)
        } else {
            None
        }
    }
}

#[derive(Debug)]
enum Slot {
    Opening,
    Capturing(CaptureSession),
    Finalizing,
}

/// Result of appending a frame.
#[derive(Debug)]
pub enum AppendOutcome {
    /// No capturing session for the device; the frame was dropped
    NoSession,
    /// Frame buffered, session still open
    Buffered { frames: usize },
    /// Frame buffered and the session completed
    Complete(ClosingSession),
}

/// Shared handle to the session table.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `device_id` if it is free.
    ///
    /// Returns `None` while any slot (opening, capturing or finalizing)
    /// exists for the device.
    pub fn reserve(&self, device_id: &str) -> Option<Reservation> {
        let mut slots = self.slots.lock();
        if slots.contains_key(device_id) {
            return None;
        }
        slots.insert(device_id.to_string(), Slot::Opening);

        Some(Reservation {
            table: self.clone(),
            device_id: device_id.to_string(),
            activated: false,
        })
    }

    /// Append a frame to the device's capturing session and evaluate
    /// completion. On completion the slot becomes `Finalizing` inside the
    /// same critical section.
    pub fn append(
        &self,
        device_id: &str,
        frame: Bytes,
        policy: &CompletionPolicy,
        now: Instant,
    ) -> AppendOutcome {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(device_id) else {
            return AppendOutcome::NoSession;
        };
        let Slot::Capturing(session) = &mut *slot else {
            return AppendOutcome::NoSession;
        };

        session.frames.push(frame);
        let frames = session.frames.len();

        let Some(reason) = policy.evaluate(session, now) else {
            return AppendOutcome::Buffered { frames };
        };

        match std::mem::replace(slot, Slot::Finalizing) {
            Slot::Capturing(session) => AppendOutcome::Complete(ClosingSession::new(
                self.clone(),
                device_id.to_string(),
                session,
                reason,
            )),
            other => {
                *slot = other;
                AppendOutcome::NoSession
            }
        }
    }

    /// Move every capturing session past its age budget to `Finalizing`.
    pub fn take_expired(&self, policy: &CompletionPolicy, now: Instant) -> Vec<ClosingSession> {
        let mut slots = self.slots.lock();
        let mut closing = Vec::new();

        for (key, slot) in slots.iter_mut() {
            let expired = matches!(
                slot,
                Slot::Capturing(session)
                    if now.saturating_duration_since(session.started_at) >= policy.max_age
            );
            if !expired {
                continue;
            }
            if let Slot::Capturing(session) = std::mem::replace(slot, Slot::Finalizing) {
                closing.push(ClosingSession::new(
                    self.clone(),
                    key.clone(),
                    session,
                    CompletionReason::Expired,
                ));
            }
        }

        closing
    }

    /// Whether the device has a session accepting frames.
    pub fn is_open(&self, device_id: &str) -> bool {
        matches!(self.slots.lock().get(device_id), Some(Slot::Capturing(_)))
    }

    /// Whether the device has any slot.
    pub fn contains(&self, device_id: &str) -> bool {
        self.slots.lock().contains_key(device_id)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn activate(&self, device_id: &str, session: CaptureSession) {
        if let Some(slot) = self.slots.lock().get_mut(device_id) {
            if matches!(slot, Slot::Opening) {
                *slot = Slot::Capturing(session);
            }
        }
    }

    fn release_opening(&self, device_id: &str) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(device_id), Some(Slot::Opening)) {
            slots.remove(device_id);
        }
    }

    fn release_finalizing(&self, device_id: &str) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(device_id), Some(Slot::Finalizing)) {
            slots.remove(device_id);
        }
    }
}

/// An `Opening` slot held while the trigger's lookups are in flight.
#[derive(Debug)]
pub struct Reservation {
    table: SessionTable,
    device_id: String,
    activated: bool,
}

impl Reservation {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Turn the reservation into a capturing session.
    pub fn activate(mut self, session: CaptureSession) {
        self.table.activate(&self.device_id, session);
        self.activated = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.activated {
            self.table.release_opening(&self.device_id);
        }
    }
}

/// A completed session on its way to finalize or abort. Dropping it removes
/// the device's slot from the table.
#[derive(Debug)]
pub struct ClosingSession {
    table: SessionTable,
    /// Table key the slot was created under
    key: String,
    session: CaptureSession,
    reason: CompletionReason,
}

impl ClosingSession {
    fn new(
        table: SessionTable,
        key: String,
        session: CaptureSession,
        reason: CompletionReason,
    ) -> Self {
        Self {
            table,
            key,
            session,
            reason,
        }
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn reason(&self) -> CompletionReason {
        self.reason
    }

    pub fn frame_count(&self) -> usize {
        self.session.frames.len()
    }
}

impl Drop for ClosingSession {
    fn drop(&mut self) {
        self.table.release_finalizing(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn device(device_id: &str) -> DeviceRecord {
        DeviceRecord {
            id: 7,
            device_id: device_id.to_string(),
            owner_id: 1,
            name: "Garden box".to_string(),
        }
    }

    fn policy() -> CompletionPolicy {
        CompletionPolicy {
            target_frames: 3,
            max_age: Duration::from_secs(6),
        }
    }

    fn open(table: &SessionTable, device_id: &str) -> Instant {
        let reservation = table.reserve(device_id).unwrap();
        let session = CaptureSession::new(device(device_id), 101, 3);
        let started = session.started_at;
        reservation.activate(session);
        started
    }

    #[test]
    fn test_reserve_is_exclusive() {
        let table = SessionTable::new();
        let first = table.reserve("cam1");
        assert!(first.is_some());
        assert!(table.reserve("cam1").is_none());
        assert!(table.reserve("cam2").is_some());
    }

    #[test]
    fn test_concurrent_reserve_admits_one() {
        let table = SessionTable::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    match table.reserve("cam1") {
                        Some(reservation) => {
                            reservation.activate(CaptureSession::new(device("cam1"), 1, 3));
                            true
                        }
                        None => false,
                    }
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(table.len(), 1);
        assert!(table.is_open("cam1"));
    }

    #[test]
    fn test_reservation_survives_await_points() {
        let table = SessionTable::new();
        let probe = table.clone();

        tokio_test::block_on(async move {
            let reservation = table.reserve("cam1").unwrap();
            tokio::task::yield_now().await;
            reservation.activate(CaptureSession::new(device("cam1"), 5, 3));
        });

        assert!(probe.is_open("cam1"));
    }

    #[test]
    fn test_dropped_reservation_releases_slot() {
        let table = SessionTable::new();
        {
            let _reservation = table.reserve("cam1").unwrap();
            assert!(table.contains("cam1"));
            assert!(!table.is_open("cam1"));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_append_without_session_is_dropped() {
        let table = SessionTable::new();
        let _reservation = table.reserve("cam1").unwrap();

        let outcome = table.append("cam1", Bytes::from_static(b"f"), &policy(), Instant::now());
        assert!(matches!(outcome, AppendOutcome::NoSession));

        let outcome = table.append("cam2", Bytes::from_static(b"f"), &policy(), Instant::now());
        assert!(matches!(outcome, AppendOutcome::NoSession));
    }

    #[test]
    fn test_append_completes_at_target() {
        let table = SessionTable::new();
        let started = open(&table, "cam1");

        for expected in 1..=2 {
            match table.append("cam1", Bytes::from(vec![expected as u8]), &policy(), started) {
                AppendOutcome::Buffered { frames } => assert_eq!(frames, expected),
                other => panic!("expected Buffered, got {:?}", other),
            }
        }

        let closing = match table.append("cam1", Bytes::from(vec![3u8]), &policy(), started) {
            AppendOutcome::Complete(closing) => closing,
            other => panic!("expected Complete, got {:?}", other),
        };

        assert_eq!(closing.reason(), CompletionReason::TargetReached);
        assert_eq!(closing.frame_count(), 3);
        let order: Vec<u8> = closing.session().frames.frames().iter().map(|f| f[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);

        // Finalizing: still blocks triggers, no longer accepts frames
        assert!(table.contains("cam1"));
        assert!(!table.is_open("cam1"));
        assert!(table.reserve("cam1").is_none());
        assert!(matches!(
            table.append("cam1", Bytes::from_static(b"late"), &policy(), started),
            AppendOutcome::NoSession
        ));

        drop(closing);
        assert!(table.is_empty());
    }

    #[test]
    fn test_append_completes_after_max_age() {
        let table = SessionTable::new();
        let started = open(&table, "cam1");

        let late = started + Duration::from_secs(6);
        match table.append("cam1", Bytes::from_static(b"f"), &policy(), late) {
            AppendOutcome::Complete(closing) => {
                assert_eq!(closing.reason(), CompletionReason::Expired);
                assert_eq!(closing.frame_count(), 1);
            }
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_take_expired_only_returns_stale_sessions() {
        let table = SessionTable::new();
        let started = open(&table, "cam1");
        let _opening = table.reserve("cam2").unwrap();

        assert!(table
            .take_expired(&policy(), started + Duration::from_secs(5))
            .is_empty());

        let expired = table.take_expired(&policy(), started + Duration::from_secs(7));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session().device_id(), "cam1");
        assert_eq!(expired[0].frame_count(), 0);
        assert!(!table.is_open("cam1"));

        drop(expired);
        assert!(!table.contains("cam1"));
        assert!(table.contains("cam2"));
    }

    #[test]
    fn test_closing_releases_slot_under_reserved_key() {
        let table = SessionTable::new();

        // Directory matched "CAM1" to the record stored as "cam1"
        let reservation = table.reserve("CAM1").unwrap();
        let session = CaptureSession::new(device("cam1"), 101, 3);
        let started = session.started_at;
        reservation.activate(session);

        let mut closing = None;
        for n in 0..3u8 {
            if let AppendOutcome::Complete(c) =
                table.append("CAM1", Bytes::from(vec![n]), &policy(), started)
            {
                closing = Some(c);
            }
        }
        let closing = closing.expect("session should complete at target");
        assert_eq!(closing.session().device_id(), "cam1");
        drop(closing);
        assert!(table.is_empty());

        let reservation = table.reserve("CAM1").unwrap();
        reservation.activate(CaptureSession::new(device("cam1"), 102, 3));
        let expired = table.take_expired(&policy(), Instant::now() + Duration::from_secs(7));
        assert_eq!(expired.len(), 1);
        drop(expired);
        assert!(table.is_empty());
        assert!(table.reserve("CAM1").is_some());
    }
}
