//! Engine launcher: wires the framer to its default collaborators and runs
//! it on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use crate::clock::SystemEpochClock;
use crate::config::EngineConfiguration;
use crate::endpoint::{DefaultChannelSupplier, DefaultEndpointFactory};
use crate::error::{EngineError, LoggingErrorHandler, Result};
use crate::framer::{AcceptAllAuthentication, Framer, NoReplayQuery, SoloStreams};
use crate::messages::{GatewayEvent, LibraryCommand};
use crate::publication::InProcessPublication;
use crate::sequence::UnindexedSequenceNumbers;
use crate::session_ids::MapSessionIds;
use crate::subscription::CommandSubscription;

/// How the framer thread behaves when a tick does no work.
#[derive(Debug, Clone, Copy)]
pub enum IdleStrategy {
    /// Spin; lowest latency, one core pinned
    BusySpin,
    /// Yield the thread to the scheduler
    Yielding,
    /// Sleep for a fixed duration
    Sleeping(Duration),
}

impl IdleStrategy {
    pub fn idle(&self, work_count: usize) {
        if work_count > 0 {
            return;
        }
        match self {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Yielding => thread::yield_now(),
            IdleStrategy::Sleeping(duration) => thread::sleep(*duration),
        }
    }
}

/// A running engine. Dropping it shuts the framer thread down.
pub struct FixEngine {
    commands: Sender<LibraryCommand>,
    events: Option<Receiver<GatewayEvent>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FixEngine {
    /// Launch with default collaborators: solo leadership, accept-all
    /// authentication, in-memory identity store, in-process bus.
    pub fn launch(configuration: EngineConfiguration) -> Result<Self> {
        Self::launch_with(configuration, IdleStrategy::Sleeping(Duration::from_millis(1)))
    }

    pub fn launch_with(
        configuration: EngineConfiguration,
        idle_strategy: IdleStrategy,
    ) -> Result<Self> {
        let (command_tx, command_subscription) = CommandSubscription::channel();
        let (event_tx, event_rx) = channel::bounded(configuration.publication_capacity);
        let endpoint_factory = DefaultEndpointFactory::new(&configuration);

        // Bind happens here, on the launching thread, so address errors
        // surface synchronously.
        let mut framer = Framer::new(
            Arc::new(SystemEpochClock),
            configuration,
            Box::new(endpoint_factory),
            command_subscription,
            Box::new(InProcessPublication::new(event_tx)),
            Box::new(MapSessionIds::new()),
            Box::new(UnindexedSequenceNumbers),
            Box::new(UnindexedSequenceNumbers),
            Box::new(NoReplayQuery),
            Box::new(SoloStreams),
            Box::new(AcceptAllAuthentication),
            Box::new(DefaultChannelSupplier),
            Box::new(LoggingErrorHandler),
        )?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("framer".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let work = framer.do_work();
                    idle_strategy.idle(work);
                }
                framer.on_close();
            })
            .map_err(EngineError::Spawn)?;

        Ok(Self {
            commands: command_tx,
            events: Some(event_rx),
            shutdown,
            thread: Some(thread),
        })
    }

    /// Sender for library command records; clone freely.
    pub fn command_sender(&self) -> Sender<LibraryCommand> {
        self.commands.clone()
    }

    /// The publication stream. There is one consumer; the first caller
    /// takes it.
    pub fn take_events(&mut self) -> Option<Receiver<GatewayEvent>> {
        self.events.take()
    }

    /// Stop the framer thread and wait for its cleanup to finish.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FixEngine {
    fn drop(&mut self) {
        self.close();
    }
}
