//! Completion tracking for outgoing publishes.
//!
//! `rumqttc` hands out packet ids inside its event loop, in request order.
//! Each publish parks a waiter here when it is queued; the event loop driver
//! pairs waiters with packet ids as `Outgoing::Publish` events arrive and
//! resolves them on the broker's acknowledgement.
//!
//! After a link loss the event loop replays unacknowledged publishes with
//! their old packet ids and re-sends requests that were still queued. Their
//! waiters have already failed, so replays and stale requests are skipped.

use super::TransportError;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;

/// Resolved once the publish is acknowledged or abandoned.
pub(super) type Waiter = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug, Default)]
pub(super) struct PendingAcks {
    linked: bool,
    /// Queued in the client, no packet id yet.
    unsent: VecDeque<Waiter>,
    /// Requests still queued when the link dropped; already failed.
    stale: usize,
    /// Sent, waiting for the broker.
    awaiting: HashMap<u16, Waiter>,
    /// Packet ids abandoned on link loss; their replays are ignored.
    orphaned: HashSet<u16>,
    /// Publish held back by the event loop until its packet id frees up.
    collided: Option<(u16, Option<Waiter>)>,
    /// Packet ids whose next acknowledgement was already accounted for.
    acked_early: HashSet<u16>,
}

impl PendingAcks {
    pub(super) fn is_linked(&self) -> bool {
        self.linked
    }

    pub(super) fn link_up(&mut self) {
        self.linked = true;
    }

    /// Park the waiter of a publish that was just queued.
    pub(super) fn queued(&mut self, waiter: Waiter) {
        self.unsent.push_back(waiter);
    }

    /// The event loop wrote a publish with `pkid` (0 for QoS 0).
    pub(super) fn sent(&mut self, pkid: u16) {
        if matches!(self.collided, Some((held, _)) if held == pkid) {
            let waiter = self.collided.take().and_then(|(_, waiter)| waiter);
            // The previous holder of this id was acked just before release.
            if let Some(previous) = self.awaiting.remove(&pkid) {
                let _ = previous.send(Ok(()));
                self.acked_early.insert(pkid);
            }
            if let Some(waiter) = waiter {
                self.awaiting.insert(pkid, waiter);
            }
            return;
        }

        if self.orphaned.contains(&pkid) {
            return;
        }

        let Some(waiter) = self.next_waiter() else {
            return;
        };
        if pkid == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            self.awaiting.insert(pkid, waiter);
        }
    }

    /// The event loop deferred a publish because `pkid` is still in use.
    pub(super) fn collided(&mut self, pkid: u16) {
        let waiter = self.next_waiter();
        self.collided = Some((pkid, waiter));
    }

    /// The broker acknowledged `pkid`.
    pub(super) fn acked(&mut self, pkid: u16) {
        if self.acked_early.remove(&pkid) {
            return;
        }
        self.orphaned.remove(&pkid);
        if let Some(waiter) = self.awaiting.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Fail every pending publish.
    pub(super) fn link_down(&mut self, reason: &str) {
        self.linked = false;

        for (pkid, waiter) in self.awaiting.drain() {
            self.orphaned.insert(pkid);
            let _ = waiter.send(Err(TransportError::Publish(reason.to_string())));
        }

        if let Some((pkid, waiter)) = self.collided.take() {
            self.orphaned.insert(pkid);
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(TransportError::Publish(reason.to_string())));
            }
        }
        self.acked_early.clear();

        self.stale += self.unsent.len();
        for waiter in self.unsent.drain(..) {
            let _ = waiter.send(Err(TransportError::Publish(reason.to_string())));
        }
    }

    fn next_waiter(&mut self) -> Option<Waiter> {
        if self.stale > 0 {
            self.stale -= 1;
            return None;
        }
        self.unsent.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    type Outcome = oneshot::Receiver<Result<(), TransportError>>;

    fn queue(acks: &mut PendingAcks) -> Outcome {
        let (tx, rx) = oneshot::channel();
        acks.queued(tx);
        rx
    }

    fn linked() -> PendingAcks {
        let mut acks = PendingAcks::default();
        acks.link_up();
        acks
    }

    #[test]
    fn publish_completes_on_ack_not_on_send() {
        let mut acks = linked();
        let mut outcome = queue(&mut acks);

        acks.sent(1);
        assert!(matches!(outcome.try_recv(), Err(TryRecvError::Empty)));

        acks.acked(1);
        assert!(outcome.try_recv().unwrap().is_ok());
    }

    #[test]
    fn acks_are_matched_by_packet_id() {
        let mut acks = linked();
        let mut first = queue(&mut acks);
        let mut second = queue(&mut acks);

        acks.sent(1);
        acks.sent(2);
        acks.acked(2);

        assert!(matches!(first.try_recv(), Err(TryRecvError::Empty)));
        assert!(second.try_recv().unwrap().is_ok());
    }

    #[test]
    fn qos0_completes_on_send() {
        let mut acks = linked();
        let mut outcome = queue(&mut acks);

        acks.sent(0);
        assert!(outcome.try_recv().unwrap().is_ok());
    }

    #[test]
    fn link_down_fails_everything_pending() {
        let mut acks = linked();
        let mut sent = queue(&mut acks);
        let mut unsent = queue(&mut acks);
        acks.sent(1);

        acks.link_down("connection reset");

        assert!(!acks.is_linked());
        assert!(matches!(
            sent.try_recv().unwrap(),
            Err(TransportError::Publish(_))
        ));
        assert!(matches!(
            unsent.try_recv().unwrap(),
            Err(TransportError::Publish(_))
        ));
    }

    #[test]
    fn replays_after_reconnect_do_not_consume_new_waiters() {
        let mut acks = linked();
        let _abandoned = queue(&mut acks);
        let _stale = queue(&mut acks);
        acks.sent(1);
        acks.link_down("connection reset");
        acks.link_up();

        let mut fresh = queue(&mut acks);

        // Replay of the unacknowledged publish, then the stale request.
        acks.sent(1);
        acks.sent(2);
        acks.acked(1);
        acks.acked(2);
        assert!(matches!(fresh.try_recv(), Err(TryRecvError::Empty)));

        acks.sent(3);
        acks.acked(3);
        assert!(fresh.try_recv().unwrap().is_ok());
    }

    #[test]
    fn collided_publish_waits_for_its_own_ack() {
        let mut acks = linked();
        let mut holder = queue(&mut acks);
        let mut deferred = queue(&mut acks);

        acks.sent(4);
        acks.collided(4);

        // Releasing the deferred publish precedes the holder's ack event.
        acks.sent(4);
        assert!(holder.try_recv().unwrap().is_ok());
        acks.acked(4);
        assert!(matches!(deferred.try_recv(), Err(TryRecvError::Empty)));

        acks.acked(4);
        assert!(deferred.try_recv().unwrap().is_ok());
    }
}
