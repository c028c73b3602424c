use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Handshake,
    Heartbeat,
    Retry,
    Debounce,
}

impl TimerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::Handshake => "handshake",
            TimerKind::Heartbeat => "heartbeat",
            TimerKind::Retry => "retry",
            TimerKind::Debounce => "debounce",
        }
    }
}

/// One-shot timers that post back into the session queue.
///
/// Every timer runs under a child of the session token, so cancelling the session
/// cancels all of them. Expiries carry a generation; an expiry whose generation is no
/// longer armed lost a race with cancellation and is ignored.
#[derive(Debug)]
pub struct Timers {
    session: CancellationToken,
    armed: HashMap<TimerKind, (u64, CancellationToken)>,
    generation: u64,
}

impl Timers {
    pub fn new(session: CancellationToken) -> Self {
        Self {
            session,
            armed: HashMap::new(),
            generation: 0,
        }
    }

    pub fn arm<T, F>(
        &mut self,
        kind: TimerKind,
        delay: Duration,
        queue: &mpsc::UnboundedSender<T>,
        expired: F,
    ) where
        T: Send + 'static,
        F: FnOnce(TimerKind, u64) -> T,
    {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;
        let token = self.session.child_token();
        let message = expired(kind, generation);
        let queue = queue.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = queue.send(message);
                }
            }
        });
        self.armed.insert(kind, (generation, token));
    }

    /// Consumes an expiry; `false` if it was superseded or cancelled meanwhile.
    pub fn fire(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some((armed, _)) if *armed == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, token)) = self.armed.remove(&kind) {
            token.cancel();
        }
    }

    /// Handshake, heartbeat and retry timers; debounce flushes survive reconnects.
    pub fn cancel_connection(&mut self) {
        for kind in [TimerKind::Handshake, TimerKind::Heartbeat, TimerKind::Retry] {
            self.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(paused)]
    async fn expiry_posts_generation_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(CancellationToken::new());
        timers.arm(TimerKind::Retry, Duration::from_secs(5), &tx, |kind, generation| {
            (kind, generation)
        });
        let (kind, generation) = rx.recv().await.expect("expiry");
        assert_eq!(kind, TimerKind::Retry);
        assert!(timers.fire(kind, generation));
        assert!(!timers.fire(kind, generation));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn rearming_supersedes_and_cancel_silences() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CancellationToken::new();
        let mut timers = Timers::new(session.clone());
        timers.arm(TimerKind::Debounce, Duration::from_millis(100), &tx, |_, g| g);
        timers.arm(TimerKind::Debounce, Duration::from_millis(300), &tx, |_, g| g);
        let generation = rx.recv().await.expect("expiry");
        assert_eq!(generation, 2);
        assert!(timers.fire(TimerKind::Debounce, generation));

        timers.arm(TimerKind::Heartbeat, Duration::from_millis(50), &tx, |_, g| g);
        session.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
