//! Inbound command subscription with controlled-fragment semantics.
//!
//! The framer polls this once per tick. A handler verdict of `Abort` keeps
//! the record at the head of the queue so it is redelivered, unchanged, on
//! the next tick; this is the redelivery half of the back-pressure
//! protocol.

use std::collections::VecDeque;

use crossbeam::channel::{self, Receiver, Sender};

use crate::messages::LibraryCommand;

/// Handler verdict for one command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Record consumed, advance past it
    Continue,
    /// Record not consumed; redeliver it on the next poll
    Abort,
    /// Record consumed, but stop polling for this tick
    Break,
}

pub trait CommandHandler {
    fn on_command(&mut self, command: &LibraryCommand) -> Action;
}

pub struct CommandSubscription {
    rx: Receiver<LibraryCommand>,
    pending: VecDeque<LibraryCommand>,
}

impl CommandSubscription {
    pub fn new(rx: Receiver<LibraryCommand>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
        }
    }

    /// Build an unbounded command channel and the subscription draining it.
    pub fn channel() -> (Sender<LibraryCommand>, Self) {
        let (tx, rx) = channel::unbounded();
        (tx, Self::new(rx))
    }

    /// Present up to `fragment_limit` records to the handler. Returns the
    /// number of records consumed.
    pub fn poll(&mut self, handler: &mut dyn CommandHandler, fragment_limit: usize) -> usize {
        let mut consumed = 0;
        while consumed < fragment_limit {
            let command = match self.pending.pop_front() {
                Some(command) => command,
                None => match self.rx.try_recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            match handler.on_command(&command) {
                Action::Continue => consumed += 1,
                Action::Abort => {
                    self.pending.push_front(command);
                    break;
                }
                Action::Break => {
                    consumed += 1;
                    break;
                }
            }
        }
        consumed
    }
}
