use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

/// Identifies one particular scheduling of a timer. A fired message whose token is no longer
///  current belongs to a timer that was cancelled or re-scheduled in the meantime.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimerToken(u64);

/// Keyed delayed messages for an actor: when a timer expires, a message is posted into the
///  actor's own mailbox.
///
/// The owning actor must pass every fired message through [Timers::fire] before acting on
///  it. Cancellation aborts the sleeping task, but a message that was posted just before
///  cancellation may still be in the mailbox; `fire` filters those out.
pub struct Timers<K, M> {
    mailbox: mpsc::UnboundedSender<M>,
    make_message: fn(K, TimerToken) -> M,
    pending: FxHashMap<K, (TimerToken, JoinHandle<()>)>,
    next_token: u64,
}

impl<K, M> Timers<K, M>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    M: Send + 'static,
{
    pub fn new(mailbox: mpsc::UnboundedSender<M>, make_message: fn(K, TimerToken) -> M) -> Timers<K, M> {
        Timers {
            mailbox,
            make_message,
            pending: Default::default(),
            next_token: 0,
        }
    }

    /// (re-)schedules the timer for `key`, replacing a timer that is already pending for it
    pub fn schedule(&mut self, key: K, delay: Duration) {
        self.cancel(key);

        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let message = (self.make_message)(key, token);
        let mailbox = self.mailbox.clone();

        trace!("scheduling timer {:?} in {:?}", key, delay);
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = mailbox.send(message);
        });
        self.pending.insert(key, (token, handle));
    }

    pub fn cancel(&mut self, key: K) -> bool {
        match self.pending.remove(&key) {
            Some((_, handle)) => {
                trace!("cancelling timer {:?}", key);
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: K) -> bool {
        self.pending.contains_key(&key)
    }

    /// Called by the owning actor when a timer message arrives. Returns `true` if the timer is
    ///  still current, and forgets it; returns `false` for stale messages, which must be
    ///  ignored.
    pub fn fire(&mut self, key: K, token: TimerToken) -> bool {
        match self.pending.get(&key) {
            Some((current, _)) if *current == token => {
                self.pending.remove(&key);
                true
            }
            _ => {
                trace!("ignoring stale timer {:?}", key);
                false
            }
        }
    }

    pub fn cancel_where(&mut self, predicate: impl Fn(&K) -> bool) {
        let keys = self.pending.keys()
            .filter(|k| predicate(k))
            .cloned()
            .collect::<Vec<_>>();
        for key in keys {
            self.cancel(key);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.pending.drain() {
            handle.abort();
        }
    }
}

impl<K, M> Drop for Timers<K, M> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.pending.drain() {
            handle.abort();
        }
    }
}
