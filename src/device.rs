use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::color::Rgb;
use crate::effects::PatternFrame;
use crate::{Error, Result};

/// Capabilities the control core needs from the lighting device.
///
/// Every call must be safe to repeat. Implementations serialise calls internally,
/// because the pattern driver and the command owner both reach the device.
pub trait LightDevice: Send + Sync {
    /// Takes control of the device
    fn start(&self) -> impl Future<Output = Result<()>> + Send;

    /// Stops any pattern, restores vendor lighting and lets go of the device
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send;

    /// Stops any pattern and shows a single color
    fn set_static_color(&self, rgb: Rgb) -> impl Future<Output = Result<()>> + Send;

    /// Replaces any running pattern with a looping one
    fn start_pattern(&self, frames: Vec<PatternFrame>) -> impl Future<Output = Result<()>> + Send;

    /// Stops the running pattern; returns once the driver has stopped writing
    fn stop_pattern(&self) -> impl Future<Output = Result<()>> + Send;

    /// Cedes the device to its external owner
    fn release(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Blocking, low-level vendor driver wrapped by [`LightingController`]
pub trait LedBackend: Send + 'static {
    /// Initialises the vendor SDK
    fn init(&mut self) -> Result<()>;
    /// Saves the vendor's own lighting so it can be restored later
    fn save_current_lighting(&mut self) -> Result<()>;
    /// Writes a color to every zone
    fn set_lighting(&mut self, rgb: Rgb) -> Result<()>;
    /// Puts back what [`LedBackend::save_current_lighting`] saved
    fn restore_lighting(&mut self) -> Result<()>;
    /// Tears the SDK session down
    fn shutdown(&mut self) -> Result<()>;
}

/// Tuning for a [`LightingController`]
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// File marking this process as the device owner
    pub lock_file: Option<PathBuf>,
    /// Minimum delay between two backend writes
    pub min_write_interval: Duration,
}

struct QueueSlot<B> {
    backend: B,
    last_command: Option<Instant>,
}

/// Command queue giving one caller at a time access to the backend, with rate limiting
struct CommandQueue<B> {
    slot: Mutex<QueueSlot<B>>,
    /// Minimum delay between commands
    min_delay: Duration,
}

impl<B: LedBackend> CommandQueue<B> {
    fn new(backend: B, min_delay: Duration) -> Self {
        Self {
            slot: Mutex::new(QueueSlot {
                backend,
                last_command: None,
            }),
            min_delay,
        }
    }

    async fn execute<T>(&self, op: impl FnOnce(&mut B) -> Result<T>) -> Result<T> {
        let mut slot = self.slot.lock().await;

        if let Some(last) = slot.last_command {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                trace!("Rate limiting: waiting {:?} before next command", wait_time);
                time::sleep(wait_time).await;
            }
        }

        let result = op(&mut slot.backend);
        slot.last_command = Some(Instant::now());
        result
    }
}

struct PatternTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ControllerState {
    initialized: bool,
    released: bool,
    pattern: Option<PatternTask>,
}

/// [`LightDevice`] implementation over a [`LedBackend`].
///
/// Patterns run on a tokio task that cycles the frames until cancelled.
/// Capability calls hold an internal lock for their whole duration.
pub struct LightingController<B: LedBackend> {
    queue: Arc<CommandQueue<B>>,
    instance_lock: Option<InstanceLock>,
    state: Mutex<ControllerState>,
}

impl<B: LedBackend> LightingController<B> {
    pub fn new(backend: B, options: ControllerOptions) -> Self {
        Self {
            queue: Arc::new(CommandQueue::new(backend, options.min_write_interval)),
            instance_lock: options.lock_file.map(InstanceLock::new),
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// True once control has been ceded with [`LightDevice::release`]
    pub async fn is_released(&self) -> bool {
        self.state.lock().await.released
    }

    /// Initialises the backend if needed. Also the reattach path after a release.
    async fn ensure_started(&self, state: &mut ControllerState) -> Result<()> {
        if state.initialized {
            return Ok(());
        }
        if state.released {
            debug!("Reattaching device control");
        }
        if let Some(lock) = &self.instance_lock {
            lock.acquire()?;
        }
        let init = self
            .queue
            .execute(|backend| {
                backend.init()?;
                backend.save_current_lighting()
            })
            .await;
        if let Err(e) = init {
            error!("Device initialisation failed: {}", e);
            if let Some(lock) = &self.instance_lock {
                lock.release();
            }
            return Err(e);
        }
        state.initialized = true;
        state.released = false;
        info!("Device control acquired");
        Ok(())
    }

    async fn halt_pattern(state: &mut ControllerState) {
        if let Some(task) = state.pattern.take() {
            trace!("Signalling pattern driver to stop");
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("Pattern driver ended abnormally: {}", e);
            }
            debug!("Pattern driver stopped");
        }
    }

    async fn hand_back(&self, state: &mut ControllerState) -> Result<()> {
        let result = self
            .queue
            .execute(|backend| {
                backend.restore_lighting()?;
                backend.shutdown()
            })
            .await;
        if let Some(lock) = &self.instance_lock {
            lock.release();
        }
        state.initialized = false;
        result
    }
}

impl<B: LedBackend> LightDevice for LightingController<B> {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_started(&mut state).await
    }

    #[instrument(skip(self))]
    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::halt_pattern(&mut state).await;
        let result = if state.initialized {
            self.hand_back(&mut state).await
        } else {
            Ok(())
        };
        state.released = false;
        info!("Device shut down");
        result
    }

    #[instrument(skip(self))]
    async fn set_static_color(&self, rgb: Rgb) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_started(&mut state).await?;
        Self::halt_pattern(&mut state).await;

        debug!("Setting static color {}", rgb);
        self.queue.execute(|backend| backend.set_lighting(rgb)).await
    }

    #[instrument(skip(self, frames), fields(frame_count = frames.len()))]
    async fn start_pattern(&self, frames: Vec<PatternFrame>) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::InvalidCommand("pattern needs at least one frame".into()));
        }
        let mut state = self.state.lock().await;
        self.ensure_started(&mut state).await?;
        Self::halt_pattern(&mut state).await;

        let token = CancellationToken::new();
        let handle = tokio::spawn(drive_pattern(
            Arc::clone(&self.queue),
            frames,
            token.clone(),
        ));
        state.pattern = Some(PatternTask { token, handle });
        debug!("Pattern driver started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop_pattern(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::halt_pattern(&mut state).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::halt_pattern(&mut state).await;
        if !state.initialized {
            return Ok(());
        }
        let result = self.hand_back(&mut state).await;
        state.released = true;
        info!("Device control released to vendor application");
        result
    }
}

/// Cycles `frames` until `token` is cancelled
async fn drive_pattern<B: LedBackend>(
    queue: Arc<CommandQueue<B>>,
    frames: Vec<PatternFrame>,
    token: CancellationToken,
) {
    loop {
        for frame in &frames {
            if token.is_cancelled() {
                return;
            }
            let color = frame.color;
            if let Err(e) = queue.execute(|backend| backend.set_lighting(color)).await {
                warn!("Pattern frame write failed: {}", e);
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = time::sleep(frame.hold()) => {}
            }
        }
    }
}

/// Lock file marking the process that currently owns the device
#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the lock file; fails if another owner already holds it
    pub fn acquire(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::DeviceFailure(format!(
                    "lock {} already exists; another instance may be running",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let payload = serde_json::json!({
            "pid": std::process::id(),
            "timestamp": chrono::Utc::now().timestamp(),
        });
        file.write_all(payload.to_string().as_bytes())?;
        debug!("Acquired lock {}", self.path.display());
        Ok(())
    }

    /// Removes the lock file; a missing file is fine
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove lock {}: {}", self.path.display(), e),
        }
    }
}

/// What a [`SimulatedBackend`] has been asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedLog {
    pub initialized: bool,
    pub inits: usize,
    pub restores: usize,
    pub writes: Vec<Rgb>,
    pub failing: bool,
}

/// In-process backend that logs writes instead of driving hardware.
///
/// Clones share one log, so a clone kept outside the controller can inspect it.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    log: Arc<SyncMutex<SimulatedLog>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> SimulatedLog {
        self.log.lock().clone()
    }

    /// Last color written, if any
    pub fn current(&self) -> Option<Rgb> {
        self.log.lock().writes.last().copied()
    }

    /// Makes every following write fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.log.lock().failing = failing;
    }
}

impl LedBackend for SimulatedBackend {
    fn init(&mut self) -> Result<()> {
        let mut log = self.log.lock();
        log.initialized = true;
        log.inits += 1;
        Ok(())
    }

    fn save_current_lighting(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_lighting(&mut self, rgb: Rgb) -> Result<()> {
        let mut log = self.log.lock();
        if !log.initialized {
            return Err(Error::DeviceFailure("backend not initialised".into()));
        }
        if log.failing {
            return Err(Error::DeviceFailure(format!("simulated write failure for {rgb}")));
        }
        debug!(color = %rgb, "Simulated lighting write");
        log.writes.push(rgb);
        Ok(())
    }

    fn restore_lighting(&mut self) -> Result<()> {
        self.log.lock().restores += 1;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.log.lock().initialized = false;
        Ok(())
    }
}
