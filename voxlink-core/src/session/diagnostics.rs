use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Counters shared by the capture sink, the send pump and the inbound reader.
pub struct SessionDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_malformed: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub segments_scheduled: AtomicUsize,
}

impl Default for SessionDiagnostics {
    fn default() -> Self {
        Self {
            frames_captured: AtomicUsize::new(0),
            frames_sent: AtomicUsize::new(0),
            frames_dropped: AtomicUsize::new(0),
            chunks_received: AtomicUsize::new(0),
            chunks_malformed: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            segments_scheduled: AtomicUsize::new(0),
        }
    }
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.chunks_malformed.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
        self.segments_scheduled.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_malformed: self.chunks_malformed.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            segments_scheduled: self.segments_scheduled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_sent: usize,
    /// Frames evicted by a newest-wins queue (ours or the transport's) or
    /// produced before the session went active.
    pub frames_dropped: usize,
    pub chunks_received: usize,
    pub chunks_malformed: usize,
    pub interrupts: usize,
    pub segments_scheduled: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_then_reset() {
        let d = SessionDiagnostics::default();
        SessionDiagnostics::bump(&d.frames_sent);
        SessionDiagnostics::bump(&d.frames_sent);
        SessionDiagnostics::bump(&d.interrupts);

        let snap = d.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.interrupts, 1);

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["framesSent"], 2);

        d.reset();
        assert_eq!(d.snapshot(), DiagnosticsSnapshot::default());
    }
}
