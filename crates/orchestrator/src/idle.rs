//! Per-session idle timers.
//!
//! Each timer is a detached sleep task. On expiry it sends an [`IdleExpiry`]
//! to the reaper loop, which re-resolves the session by index under the
//! registry lock. Every reschedule gets a fresh timer id, so a message from a
//! replaced or aborted timer is recognised as stale and ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IdleExpiry {
    pub index: usize,
    pub timer_id: u64,
}

struct IdleTimer {
    id: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct IdleTimers {
    timers: HashMap<usize, IdleTimer>,
    next_id: u64,
    expiry_tx: mpsc::UnboundedSender<IdleExpiry>,
}

impl IdleTimers {
    pub fn new(expiry_tx: mpsc::UnboundedSender<IdleExpiry>) -> Self {
        Self {
            timers: HashMap::new(),
            next_id: 0,
            expiry_tx,
        }
    }

    /// Replaces any timer for `index` with one firing after `after`.
    pub fn schedule(&mut self, index: usize, after: Duration) {
        self.cancel(index);

        self.next_id += 1;
        let timer_id = self.next_id;
        let tx = self.expiry_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(IdleExpiry { index, timer_id });
        });

        self.timers.insert(index, IdleTimer { id: timer_id, handle });
    }

    pub fn cancel(&mut self, index: usize) {
        if let Some(timer) = self.timers.remove(&index) {
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    /// Claims an expiry if it came from the live timer for its index.
    pub fn take_if_current(&mut self, expiry: IdleExpiry) -> bool {
        match self.timers.get(&expiry.index) {
            Some(timer) if timer.id == expiry.timer_id => {
                self.timers.remove(&expiry.index);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.timers.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.timers.keys().copied().collect();
        indices.sort_unstable();
        indices
    }
}

impl Drop for IdleTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reschedule_makes_earlier_expiry_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = IdleTimers::new(tx);

        timers.schedule(0, Duration::from_millis(5));
        let first = rx.recv().await.expect("first expiry");

        timers.schedule(0, Duration::from_secs(60));
        assert!(!timers.take_if_current(first));
        assert!(timers.contains(0));
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = IdleTimers::new(tx);

        timers.schedule(3, Duration::from_millis(20));
        timers.cancel(3);
        assert_eq!(timers.len(), 0);

        let fired = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
        assert!(fired.is_err(), "aborted timer must not deliver an expiry");
    }

    #[tokio::test]
    async fn current_expiry_is_claimed_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = IdleTimers::new(tx);

        timers.schedule(1, Duration::from_millis(5));
        timers.schedule(2, Duration::from_secs(60));
        let expiry = rx.recv().await.expect("expiry");
        assert_eq!(expiry.index, 1);
        assert!(timers.take_if_current(expiry));
        assert!(!timers.take_if_current(expiry));
        assert_eq!(timers.indices(), vec![2]);
    }
}
