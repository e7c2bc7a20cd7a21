//! The wakers of the futures waiting on one batch.

use std::{collections::HashMap, task::Waker};

/// Identifies one waiting future's entry in a [`WakerSet`]. A token is owned
/// by exactly one future and is never cloned outside this module.
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(u64);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// Every future that returned `Pending` from a batch, keyed by token.
///
/// One of them is the driver: whichever polled the batch most recently, and
/// so the one whose waker the window and the running fetches will wake. The
/// rest sleep until one of these happens:
///
/// - a tag group settles, and the futures of that group can read their
///   values ([`wake_all_except`](Self::wake_all_except));
/// - the driver leaves while fetches are still running
///   ([`remove_and_hand_off`](Self::remove_and_hand_off));
/// - the controller flushes the batch, which only needs the driver
///   ([`wake_driver`](Self::wake_driver)).
#[derive(Debug, Default)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driver: Option<Token>,

    // Number of tokens handed out so far
    issued: u64,
}

impl WakerSet {
    /// Record the waker of a future that is about to return `Pending`, and
    /// make that future the driver. A future registering for the first time
    /// gets its token stored in `slot`.
    pub(crate) fn upsert(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        let issued = &mut self.issued;
        let token = slot.get_or_insert_with(|| {
            *issued += 1;
            Token(*issued)
        });

        match self.wakers.get_mut(token) {
            Some(existing) if existing.will_wake(waker) => {}
            Some(existing) => existing.clone_from(waker),
            None => {
                self.wakers.insert(token.duplicate(), waker.clone());
            }
        }

        self.driver = Some(token.duplicate());
    }

    /// Forget a future once nothing in the batch is left for anyone to
    /// drive.
    pub(crate) fn remove(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driver.as_ref() == Some(&token) {
            self.driver = None;
        }
    }

    /// Forget a future while the batch still has work left. If it was the
    /// driver, or nobody was, another waiting future is promoted and woken
    /// to take over. The promotion is immediate, so a run of drops always
    /// leaves a registered driver behind as long as anyone is waiting.
    pub(crate) fn remove_and_hand_off(&mut self, token: Token) {
        self.wakers.remove(&token);

        let orphaned = match self.driver {
            Some(ref driver) => *driver == token,
            None => true,
        };

        if orphaned {
            self.driver = self.wakers.iter().next().map(|(next, waker)| {
                waker.wake_by_ref();
                next.duplicate()
            });
        }
    }

    /// Wake the driver, if any. Used when the batch can make progress for a
    /// reason the driver can't observe, like an explicit flush.
    pub(crate) fn wake_driver(&self) {
        if let Some(waker) = self
            .driver
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    /// Wake every waker except `skip`. The wakers stay registered, since
    /// their futures may still be waiting on a different part of the batch.
    pub(crate) fn wake_all_except(&self, skip: Option<&Token>) {
        self.wakers
            .iter()
            .filter(|(token, _waker)| Some(*token) != skip)
            .for_each(|(_token, waker)| waker.wake_by_ref());
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cooked_waker::{IntoWaker, WakeRef};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// A waker that counts how many times it was woken
    #[derive(Debug, Clone, Default, IntoWaker)]
    struct CountWaker {
        count: Arc<AtomicUsize>,
    }

    impl WakeRef for CountWaker {
        fn wake_by_ref(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl cooked_waker::Wake for CountWaker {}

    impl CountWaker {
        fn wakes(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    fn register(set: &mut WakerSet, waker: &CountWaker) -> Token {
        let mut slot = None;
        set.upsert(&mut slot, &waker.clone().into_waker());
        slot.unwrap()
    }

    #[test]
    fn removing_a_bystander_wakes_nobody() {
        let a = CountWaker::default();
        let b = CountWaker::default();
        let mut set = WakerSet::default();

        let token_a = register(&mut set, &a);
        let token_b = register(&mut set, &b);

        // b polled last, so it's the driver. Dropping a changes nothing.
        set.remove_and_hand_off(token_a);
        assert_eq!(a.wakes(), 0);
        assert_eq!(b.wakes(), 0);
        assert_eq!(set.len(), 1);

        set.wake_driver();
        assert_eq!(b.wakes(), 1);

        set.remove_and_hand_off(token_b);
        assert_eq!(set.len(), 0);
        assert_eq!(b.wakes(), 1);
    }

    #[test]
    fn removing_the_driver_hands_off() {
        let a = CountWaker::default();
        let b = CountWaker::default();
        let mut set = WakerSet::default();

        let token_a = register(&mut set, &a);
        let token_b = register(&mut set, &b);

        set.remove_and_hand_off(token_b);
        assert_eq!(a.wakes(), 1);

        // a is now driving
        set.wake_driver();
        assert_eq!(a.wakes(), 2);

        set.remove(token_a);
        set.wake_driver();
        assert_eq!(a.wakes(), 2);
    }

    #[test]
    fn upsert_and_wake_all_except() {
        let a = CountWaker::default();
        let b = CountWaker::default();
        let mut set = WakerSet::default();

        let mut slot_a = None;
        let mut slot_b = None;
        set.upsert(&mut slot_a, &a.clone().into_waker());
        set.upsert(&mut slot_b, &b.clone().into_waker());
        set.upsert(&mut slot_a, &a.clone().into_waker());
        assert_eq!(set.len(), 2);
        assert_ne!(slot_a, slot_b);

        // a re-registered last, so it drives
        set.wake_driver();
        assert_eq!(a.wakes(), 1);

        set.wake_all_except(slot_a.as_ref());
        assert_eq!(a.wakes(), 1);
        assert_eq!(b.wakes(), 1);

        set.wake_all_except(None);
        assert_eq!(a.wakes(), 2);
        assert_eq!(b.wakes(), 2);
    }
}
