use attire_asyncutils::Progress;
use derive_more::Display;
use std::sync::{Mutex, PoisonError};

/// Where a transfer group is in its lifecycle.
///
/// ```text
/// Initializing -> WaitingForSlot -> [WaitingForQueue ->] Downloading -> Decompressing -> Done
///                                                       Uploading ------------------> Done
/// ```
///
/// Every transfer passes through `WaitingForSlot`. Only batched downloads
/// wait on the broker's queue. A container decodes one file at a time, so it
/// returns from `Decompressing` to `Downloading` between files. Failure has
/// no state: the tracker is simply dropped.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Initializing,
    WaitingForSlot,
    WaitingForQueue,
    Downloading,
    Uploading,
    Decompressing,
    Done,
}

impl TransferStatus {
    pub fn can_advance_to(self, next: Self) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Initializing, WaitingForSlot)
                | (WaitingForSlot, WaitingForQueue | Downloading | Uploading)
                | (WaitingForQueue, Downloading)
                | (Downloading, Decompressing)
                | (Decompressing, Downloading | Done)
                | (Uploading, Done)
        )
    }
}

/// Status and byte progress of one transfer group.
#[derive(Debug)]
pub struct TransferTracker {
    status: Mutex<TransferStatus>,
    progress: Mutex<Progress>,
}

impl TransferTracker {
    pub fn new(total: u64) -> Self {
        Self { status: Mutex::new(TransferStatus::Initializing), progress: Mutex::new(Progress::new(total)) }
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`. Invalid transitions are logged and ignored.
    pub fn advance(&self, next: TransferStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *status;
        if !current.can_advance_to(next) {
            tracing::warn!(from = %current, to = %next, "Rejected invalid transfer status transition");
            return false;
        }
        tracing::trace!(from = %current, to = %next, "Transfer status changed");
        *status = next;
        true
    }

    pub fn progress(&self) -> Progress {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Start counting from zero again, for a transfer that's being retried.
    /// Returns the counter the retry should add to.
    pub fn restart_progress(&self, total: u64) -> Progress {
        let fresh = Progress::new(total);
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::TransferStatus::*;
    use rstest::rstest;

    #[rstest]
    #[case::direct(&[WaitingForSlot, Downloading, Decompressing, Done])]
    #[case::batched(&[WaitingForSlot, WaitingForQueue, Downloading, Decompressing, Downloading, Decompressing, Done])]
    #[case::upload(&[WaitingForSlot, Uploading, Done])]
    fn test_valid_paths(#[case] path: &[TransferStatus]) {
        let tracker = TransferTracker::new(0);
        for &status in path {
            assert!(tracker.advance(status), "{status}");
        }
        assert_eq!(tracker.status(), Done);
    }

    #[rstest]
    #[case::skips_slot(Initializing, Downloading)]
    #[case::skips_slot_for_queue(Initializing, WaitingForQueue)]
    #[case::upload_decompresses(Uploading, Decompressing)]
    #[case::queue_to_upload(WaitingForQueue, Uploading)]
    #[case::restart(Done, Initializing)]
    #[case::unfinished_download(Downloading, Done)]
    fn test_invalid_transitions(#[case] from: TransferStatus, #[case] to: TransferStatus) {
        assert!(!from.can_advance_to(to));
    }

    #[test]
    fn test_rejected_transition_keeps_status() {
        let tracker = TransferTracker::new(10);
        assert!(!tracker.advance(Downloading));
        assert_eq!(tracker.status(), Initializing);
        assert_eq!(tracker.progress().total(), 10);
    }

    #[test]
    fn test_restarted_progress_is_what_gets_reported() {
        let tracker = TransferTracker::new(100);
        let first = tracker.progress();
        first.add(100);

        let retry = tracker.restart_progress(80);
        assert_eq!((tracker.progress().transferred(), tracker.progress().total()), (0, 80));
        retry.add(30);
        first.add(5);
        assert_eq!(tracker.progress().transferred(), 30);
    }
}
