//! Completion tracking for the two asynchronous card transfers.
//!
//! Each transfer kind owns a single-slot channel. Arming a slot hands a
//! [`Completer`] to the DMA callback; the callback resolves it from the bus's
//! interrupt context and the orchestrator blocks on the receiving side. An idle
//! slot counts as complete so joining before anything was issued returns at once.

use crate::bus::Channel;
use crate::error::{Error, Result, TransferKind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::time::{Duration, Instant};
use tracing::trace;

enum SlotState<T> {
    Idle,
    Pending(Receiver<T>),
    Done(T),
    Abandoned,
}

/// Producer side of an armed slot, moved into the DMA completion callback
pub struct Completer<T> {
    tx: SyncSender<T>,
}

impl<T> Completer<T> {
    pub fn complete(self, value: T) {
        // The session may already be gone; nobody is left to observe the result.
        let _ = self.tx.send(value);
    }
}

/// One outstanding asynchronous transfer of a given kind
pub struct CompletionSlot<T> {
    channel: Channel,
    kind: TransferKind,
    state: SlotState<T>,
}

impl<T> CompletionSlot<T> {
    pub fn new(channel: Channel, kind: TransferKind) -> Self {
        Self {
            channel,
            kind,
            state: SlotState::Idle,
        }
    }

    /// Mark the transfer as outstanding. Fails while the previous one has not
    /// been observed complete.
    pub fn arm(&mut self) -> Result<Completer<T>> {
        self.poll();
        if matches!(self.state, SlotState::Pending(_)) {
            return Err(Error::TransferInFlight {
                channel: self.channel,
                kind: self.kind,
            });
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.state = SlotState::Pending(rx);
        trace!("{} {} armed", self.channel, self.kind);
        Ok(Completer { tx })
    }

    /// Return to idle without waiting, used when the DMA could not be issued
    pub fn cancel(&mut self) {
        self.state = SlotState::Idle;
    }

    /// Pick up a completion if one has arrived, without blocking
    pub fn poll(&mut self) {
        if let SlotState::Pending(rx) = &self.state {
            match rx.try_recv() {
                Ok(value) => self.state = SlotState::Done(value),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.state = SlotState::Abandoned,
            }
        }
    }

    pub fn is_done(&mut self) -> bool {
        self.poll();
        !matches!(self.state, SlotState::Pending(_))
    }

    /// Take the result of a finished transfer, leaving the slot idle
    pub fn take_done(&mut self) -> Result<Option<T>> {
        self.poll();
        match std::mem::replace(&mut self.state, SlotState::Idle) {
            SlotState::Done(value) => Ok(Some(value)),
            SlotState::Abandoned => Err(self.abandoned()),
            SlotState::Idle => Ok(None),
            pending @ SlotState::Pending(_) => {
                self.state = pending;
                Ok(None)
            }
        }
    }

    /// Block until the slot is no longer pending.
    ///
    /// With no deadline this waits forever; a card that never finishes its DMA
    /// hangs the caller.
    pub fn wait(&mut self, deadline: Option<Instant>, started: Instant) -> Result<Option<T>> {
        if let SlotState::Pending(rx) = &self.state {
            let received = match deadline {
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            };
            match received {
                Ok(value) => self.state = SlotState::Done(value),
                Err(RecvTimeoutError::Disconnected) => self.state = SlotState::Abandoned,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::DeviceUnresponsive {
                        channel: self.channel,
                        waited: started.elapsed(),
                    });
                }
            }
            trace!("{} {} complete", self.channel, self.kind);
        }
        self.take_done()
    }

    fn abandoned(&self) -> Error {
        Error::TransferAbandoned {
            channel: self.channel,
            kind: self.kind,
        }
    }
}

/// Program and read completion for one channel
pub struct TransferSynchronizer {
    program: CompletionSlot<()>,
    read: CompletionSlot<Box<[u8]>>,
    timeout: Option<Duration>,
}

impl TransferSynchronizer {
    pub fn new(channel: Channel, timeout: Option<Duration>) -> Self {
        Self {
            program: CompletionSlot::new(channel, TransferKind::Program),
            read: CompletionSlot::new(channel, TransferKind::Read),
            timeout,
        }
    }

    pub fn program(&mut self) -> &mut CompletionSlot<()> {
        &mut self.program
    }

    pub fn read(&mut self) -> &mut CompletionSlot<Box<[u8]>> {
        &mut self.read
    }

    pub fn program_done(&mut self) -> bool {
        self.program.is_done()
    }

    pub fn read_done(&mut self) -> bool {
        self.read.is_done()
    }

    /// Wait for both transfers. Returns the read buffer if a read finished.
    pub fn join(&mut self) -> Result<Option<Box<[u8]>>> {
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);
        self.program.wait(deadline, started)?;
        self.read.wait(deadline, started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn join_with_nothing_issued_returns_immediately() {
        let mut sync = TransferSynchronizer::new(Channel::Exi0, None);
        assert!(sync.program_done());
        assert!(sync.read_done());
        assert!(sync.join().unwrap().is_none());
    }

    #[test]
    fn join_waits_for_both_completions() {
        let mut sync = TransferSynchronizer::new(Channel::Exi0, None);
        let program = sync.program().arm().unwrap();
        let read = sync.read().arm().unwrap();
        assert!(!sync.program_done());
        assert!(!sync.read_done());

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            program.complete(());
            thread::sleep(Duration::from_millis(20));
            read.complete(vec![7u8; 4].into_boxed_slice());
        });

        let buffer = sync.join().unwrap().expect("read buffer returned");
        assert_eq!(&*buffer, &[7, 7, 7, 7]);
        assert!(sync.program_done());
        assert!(sync.read_done());
        worker.join().unwrap();
    }

    #[test]
    fn arming_a_pending_slot_is_rejected() {
        let mut slot: CompletionSlot<()> = CompletionSlot::new(Channel::Exi1, TransferKind::Program);
        let completer = slot.arm().unwrap();
        match slot.arm() {
            Err(Error::TransferInFlight { channel, kind }) => {
                assert_eq!(channel, Channel::Exi1);
                assert_eq!(kind, TransferKind::Program);
            }
            other => panic!("expected in-flight rejection, got {:?}", other.err()),
        }
        completer.complete(());
        assert!(slot.arm().is_ok());
    }

    #[test]
    fn dropped_completer_reports_abandoned() {
        let mut sync = TransferSynchronizer::new(Channel::Exi0, None);
        drop(sync.read().arm().unwrap());
        assert!(matches!(
            sync.join(),
            Err(Error::TransferAbandoned { kind: TransferKind::Read, .. })
        ));
        // Reported once, then idle again
        assert!(sync.join().unwrap().is_none());
    }

    #[test]
    fn timeout_reports_unresponsive_and_keeps_waiting_possible() {
        let mut sync = TransferSynchronizer::new(Channel::Exi0, Some(Duration::from_millis(10)));
        let completer = sync.program().arm().unwrap();
        assert!(matches!(
            sync.join(),
            Err(Error::DeviceUnresponsive { channel: Channel::Exi0, .. })
        ));
        completer.complete(());
        assert!(sync.join().is_ok());
    }

    #[test]
    fn take_done_leaves_pending_slot_alone() {
        let mut slot: CompletionSlot<u8> = CompletionSlot::new(Channel::Exi0, TransferKind::Read);
        let completer = slot.arm().unwrap();
        assert_eq!(slot.take_done().unwrap(), None);
        assert!(!slot.is_done());
        completer.complete(3);
        assert_eq!(slot.take_done().unwrap(), Some(3));
        assert!(slot.is_done());
    }
}
