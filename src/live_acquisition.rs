use crate::capture_frame::RawCaptureFrame;
use crate::capture_store::{CaptureStore, CaptureStoreError};
use crate::la8_device::{La8Device, ProtocolError};
use crate::serial_terminal::Transport;
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Idle,
    Running,
    Paused,
}

impl fmt::Display for LiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("Cannot {action} a live session that is {from}")]
    InvalidTransition {
        from: LiveState,
        action: &'static str,
    },

    #[error("Live capture stopped: {0}")]
    Capture(#[from] ProtocolError),

    #[error("Live capture stopped: {0}")]
    Store(#[from] CaptureStoreError),

    #[error("Live capture worker is gone")]
    WorkerGone,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveConfig {
    interval: Duration,
    retention: Duration,
    capture_timeout: Duration,
    event_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            interval: LiveConfig::DEFAULT_INTERVAL,
            retention: LiveConfig::DEFAULT_RETENTION,
            capture_timeout: Duration::from_secs(5),
            event_capacity: LiveConfig::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl LiveConfig {
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
    pub const MAX_INTERVAL: Duration = Duration::from_millis(5000);
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    /// Spacing between capture starts, clamped to 100 ms..=5 s.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = clamp_interval(interval);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_capture_timeout(mut self, capture_timeout: Duration) -> Self {
        self.capture_timeout = capture_timeout;
        self
    }

    /// Events a [`LiveWorker`] queues for its handle. Once the queue is full
    /// further events are dropped until the caller drains it.
    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn capture_timeout(&self) -> Duration {
        self.capture_timeout
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(LiveConfig::MIN_INTERVAL, LiveConfig::MAX_INTERVAL)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LiveStats {
    pub captures: u64,
    pub short_reads: u64,
    pub busy_retries: u64,
    /// Ticks that fell due while a capture was still running.
    pub coalesced_ticks: u64,
    /// Worker events lost because the handle's queue was full.
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing was due, or a capture is still in flight.
    NotDue,
    Appended {
        new_samples: usize,
        trimmed: usize,
        total_samples: usize,
    },
    /// The device was busy; the next tick retries.
    Busy,
    /// The session ended while the capture was in flight; its result was dropped.
    Discarded,
}

/// Live acquisition session: periodic captures accumulated into one
/// rolling [`CaptureStore`].
///
/// The session never sleeps or spawns anything itself. A driver calls
/// [`tick`](Self::tick) (or the split [`begin_tick`](Self::begin_tick) /
/// [`finish_tick`](Self::finish_tick) pair) and the session decides whether
/// a capture is due. At most one capture is ever in flight.
pub struct LiveAcquisition {
    config: LiveConfig,
    state: LiveState,
    store: Option<CaptureStore>,
    next_tick: Option<Instant>,
    in_flight: Option<Instant>,
    stats: LiveStats,
}

impl LiveAcquisition {
    pub fn new(config: LiveConfig) -> Self {
        Self {
            config,
            state: LiveState::Idle,
            store: None,
            next_tick: None,
            in_flight: None,
            stats: LiveStats::default(),
        }
    }

    pub fn state(&self) -> LiveState {
        self.state
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn stats(&self) -> LiveStats {
        self.stats
    }

    /// When the next capture becomes due, if one is scheduled.
    pub fn next_tick(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn is_capturing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Views should follow the newest data only while running.
    pub fn auto_scroll(&self) -> bool {
        self.state == LiveState::Running
    }

    /// The session's data. Kept after [`stop`](Self::stop) until the next
    /// [`start`](Self::start).
    pub fn store(&self) -> Option<&CaptureStore> {
        self.store.as_ref()
    }

    pub fn take_store(&mut self) -> Option<CaptureStore> {
        self.store.take()
    }

    pub fn start(&mut self, now: Instant) -> Result<(), LiveError> {
        if self.state != LiveState::Idle {
            return Err(self.invalid("start"));
        }

        self.store = None;
        self.stats = LiveStats::default();
        self.state = LiveState::Running;
        self.next_tick = Some(now + self.config.interval);
        log::info!("Live capture started (interval: {:?})", self.config.interval);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), LiveError> {
        if self.state != LiveState::Running {
            return Err(self.invalid("pause"));
        }

        self.state = LiveState::Paused;
        self.next_tick = None;
        log::info!("Live capture paused");
        Ok(())
    }

    pub fn resume(&mut self, now: Instant) -> Result<(), LiveError> {
        if self.state != LiveState::Paused {
            return Err(self.invalid("resume"));
        }

        self.state = LiveState::Running;
        self.next_tick = Some(now + self.config.interval);
        log::info!("Live capture resumed");
        Ok(())
    }

    /// Back to idle from any state. A capture already in flight is left to
    /// finish; its result is dropped.
    pub fn stop(&mut self) {
        if self.state != LiveState::Idle {
            log::info!(
                "Live capture stopped ({} samples buffered)",
                self.store.as_ref().map_or(0, CaptureStore::sample_count)
            );
        }
        self.state = LiveState::Idle;
        self.next_tick = None;
    }

    /// Change the spacing; a running session restarts its countdown from `now`.
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.config.interval = clamp_interval(interval);
        if self.state == LiveState::Running {
            self.next_tick = Some(now + self.config.interval);
        }
        log::debug!("Live interval set to {:?}", self.config.interval);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.state == LiveState::Running && self.next_tick.is_some_and(|t| now >= t)
    }

    /// Claim the next capture slot. Returns `false` when nothing is due or
    /// another capture is still outstanding.
    pub fn begin_tick(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        if self.in_flight.is_some() {
            self.stats.coalesced_ticks += 1;
            return false;
        }

        self.in_flight = Some(now);
        true
    }

    /// Account for the capture started by [`begin_tick`](Self::begin_tick).
    ///
    /// Successful frames are appended and the store trimmed to the retention
    /// window. `Busy` leaves the retry to the next tick; any other error
    /// stops the session and is returned.
    pub fn finish_tick(
        &mut self,
        result: Result<RawCaptureFrame, ProtocolError>,
        finished: Instant,
    ) -> Result<TickOutcome, LiveError> {
        let started = self.in_flight.take().unwrap_or(finished);

        if self.state == LiveState::Idle {
            log::debug!("Dropping capture result of a stopped session");
            return Ok(TickOutcome::Discarded);
        }

        if self.state == LiveState::Running {
            let spaced = started + self.config.interval;
            if finished > spaced {
                self.stats.coalesced_ticks += 1;
            }
            self.next_tick = Some(spaced.max(finished));
        }

        match result {
            Ok(frame) => self.absorb(&frame),
            Err(ProtocolError::Busy) => {
                self.stats.busy_retries += 1;
                log::warn!("Device busy, retrying on the next tick");
                Ok(TickOutcome::Busy)
            }
            Err(e) => {
                log::error!("Capture failed: {}", e);
                self.stop();
                Err(e.into())
            }
        }
    }

    fn absorb(&mut self, frame: &RawCaptureFrame) -> Result<TickOutcome, LiveError> {
        self.stats.captures += 1;
        if frame.is_short() {
            self.stats.short_reads += 1;
        }

        if let Some(store) = &mut self.store {
            if let Err(e) = store.append(frame) {
                self.stop();
                return Err(e.into());
            }
        } else {
            self.store = Some(CaptureStore::from_frame(frame));
        }

        let retention = self.config.retention.as_secs_f64();
        let (trimmed, total_samples) = self.store.as_mut().map_or((0, 0), |store| {
            (store.keep_duration(retention), store.sample_count())
        });
        Ok(TickOutcome::Appended {
            new_samples: frame.received(),
            trimmed,
            total_samples,
        })
    }

    /// Run one capture on `device` if one is due at `now`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn tick<T: Transport>(
        &mut self,
        device: &mut La8Device<T>,
        now: Instant,
    ) -> Result<TickOutcome, LiveError> {
        if !self.begin_tick(now) {
            return Ok(TickOutcome::NotDue);
        }

        let clock = Instant::now();
        let result = device.capture(self.config.capture_timeout);
        self.finish_tick(result, now + clock.elapsed())
    }

    fn invalid(&self, action: &'static str) -> LiveError {
        LiveError::InvalidTransition {
            from: self.state,
            action,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LiveCommand {
    Pause,
    Resume,
    SetInterval(Duration),
    Stop,
}

#[derive(Debug)]
pub enum LiveEvent {
    Captured {
        new_samples: usize,
        trimmed: usize,
        total_samples: usize,
    },
    Busy,
    StateChanged(LiveState),
    /// The worker has finished; carries the error that ended it, if any.
    Stopped(Option<LiveError>),
}

/// Runs a [`LiveAcquisition`] against a device on its own thread.
pub struct LiveWorker;

impl LiveWorker {
    /// Start a session and hand `device` to a worker thread. The device
    /// comes back from [`LiveHandle::join`].
    pub fn spawn<T: Transport + 'static>(
        device: La8Device<T>,
        config: LiveConfig,
    ) -> Result<LiveHandle<T>, LiveError> {
        let mut session = LiveAcquisition::new(config);
        session.start(Instant::now())?;

        let session = Arc::new(Mutex::new(session));
        let (command_tx, command_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::sync_channel(config.event_capacity());

        let shared = Arc::clone(&session);
        let thread = thread::Builder::new()
            .name("la8-live".to_string())
            .spawn(move || run_worker(device, &shared, &command_rx, &event_tx))
            .map_err(|e| {
                log::error!("Failed to spawn live worker: {}", e);
                LiveError::WorkerGone
            })?;

        Ok(LiveHandle {
            commands: command_tx,
            events: event_rx,
            session,
            thread,
        })
    }
}

fn lock(session: &Mutex<LiveAcquisition>) -> MutexGuard<'_, LiveAcquisition> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_worker<T: Transport>(
    mut device: La8Device<T>,
    session: &Mutex<LiveAcquisition>,
    commands: &Receiver<LiveCommand>,
    events: &SyncSender<LiveEvent>,
) -> La8Device<T> {
    // Never block the capture loop on a slow reader.
    let emit = |event: LiveEvent| match events.try_send(event) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(event)) => {
            log::debug!("Event queue full, dropping {:?}", event);
            lock(session).stats.dropped_events += 1;
        }
    };

    loop {
        let next_tick = lock(session).next_tick();
        let received = match next_tick {
            Some(at) => commands.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(command) => {
                let mut guard = lock(session);
                let applied = match command {
                    LiveCommand::Pause => guard.pause(),
                    LiveCommand::Resume => guard.resume(Instant::now()),
                    LiveCommand::SetInterval(interval) => {
                        guard.set_interval(interval, Instant::now());
                        Ok(())
                    }
                    LiveCommand::Stop => {
                        guard.stop();
                        drop(guard);
                        emit(LiveEvent::StateChanged(LiveState::Idle));
                        emit(LiveEvent::Stopped(None));
                        return device;
                    }
                };
                let state = guard.state();
                drop(guard);

                match applied {
                    Ok(()) => emit(LiveEvent::StateChanged(state)),
                    Err(e) => log::warn!("Ignoring live command {:?}: {}", command, e),
                }
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                lock(session).stop();
                emit(LiveEvent::Stopped(None));
                return device;
            }
        }

        if !lock(session).begin_tick(Instant::now()) {
            continue;
        }

        // The session lock is not held while the link is busy, so readers
        // can still look at the store.
        let timeout = lock(session).config().capture_timeout();
        let result = device.capture(timeout);
        let outcome = lock(session).finish_tick(result, Instant::now());

        match outcome {
            Ok(TickOutcome::Appended {
                new_samples,
                trimmed,
                total_samples,
            }) => emit(LiveEvent::Captured {
                new_samples,
                trimmed,
                total_samples,
            }),
            Ok(TickOutcome::Busy) => emit(LiveEvent::Busy),
            Ok(TickOutcome::NotDue | TickOutcome::Discarded) => {}
            Err(e) => {
                emit(LiveEvent::StateChanged(LiveState::Idle));
                emit(LiveEvent::Stopped(Some(e)));
                return device;
            }
        }
    }
}

/// Control side of a [`LiveWorker`].
pub struct LiveHandle<T: Transport> {
    commands: Sender<LiveCommand>,
    events: Receiver<LiveEvent>,
    session: Arc<Mutex<LiveAcquisition>>,
    thread: JoinHandle<La8Device<T>>,
}

impl<T: Transport> LiveHandle<T> {
    pub fn pause(&self) -> Result<(), LiveError> {
        self.send(LiveCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), LiveError> {
        self.send(LiveCommand::Resume)
    }

    pub fn set_interval(&self, interval: Duration) -> Result<(), LiveError> {
        self.send(LiveCommand::SetInterval(interval))
    }

    fn send(&self, command: LiveCommand) -> Result<(), LiveError> {
        self.commands
            .send(command)
            .map_err(|_| LiveError::WorkerGone)
    }

    /// Worker events, queued up to [`LiveConfig::event_capacity`]. Events that
    /// do not fit are dropped and counted in [`LiveStats::dropped_events`].
    pub fn events(&self) -> &Receiver<LiveEvent> {
        &self.events
    }

    pub fn state(&self) -> LiveState {
        lock(&self.session).state()
    }

    pub fn stats(&self) -> LiveStats {
        lock(&self.session).stats()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Look at the current store. Appends wait while `f` runs, so keep it short.
    pub fn with_store<R>(&self, f: impl FnOnce(Option<&CaptureStore>) -> R) -> R {
        f(lock(&self.session).store())
    }

    /// Stop the session, wait for an in-flight capture to complete, and get
    /// the device and the collected data back.
    pub fn join(self) -> Result<(La8Device<T>, Option<CaptureStore>), LiveError> {
        // Fails only if the worker already ended by itself.
        let _ = self.commands.send(LiveCommand::Stop);
        let device = self.thread.join().map_err(|_| LiveError::WorkerGone)?;
        let store = lock(&self.session).take_store();
        Ok((device, store))
    }
}
