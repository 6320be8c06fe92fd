//! Capture-device controller.
//!
//! Owns the physical device through a [`CapturePlatform`], binds the stream
//! to a render target obtained from the [`SurfaceBroker`], and runs the
//! bounded open/retry state machine. All device handling happens on one
//! dedicated task: commands, driver events, retry timers and target-lost
//! notifications land in the same `select!` loop and are processed one at a
//! time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use signcast_core::{Size, SigncastError};

use crate::broker::{RenderTarget, SurfaceBroker};
use crate::platform::{CapturePlatform, DeviceEvent, DeviceInfo, DeviceSession};
use crate::size::choose_optimal_size;

// MARK: - Public types

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Opening,
    Configuring,
    Streaming,
    Disconnected,
    Error,
    /// Terminal: explicit close, or the retry bound was exhausted.
    Stopped,
}

/// Status callbacks surfaced to the owning shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Started,
    Stopped,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Fallback device id when no external-flagged device is enumerated.
    pub preferred_device_id: Option<String>,
    pub requested_size: Size,
    pub retry_delay: Duration,
    pub max_retry_attempts: u32,
    /// Bounded wait for the device acquisition lock.
    pub lock_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            preferred_device_id: None,
            requested_size: Size::FHD,
            retry_delay: Duration::from_secs(3),
            max_retry_attempts: 3,
            lock_timeout: Duration::from_millis(2500),
        }
    }
}

// MARK: - Handle

enum Cmd {
    Open,
    Close(oneshot::Sender<()>),
}

/// Handle to the controller task. Cheap to clone.
#[derive(Clone)]
pub struct CaptureController {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    state_rx: watch::Receiver<CaptureState>,
    device_lock: Arc<Mutex<()>>,
}

impl CaptureController {
    /// Spawn the controller task. `events` receives the status callbacks.
    pub fn spawn(
        platform: Arc<dyn CapturePlatform>,
        broker: SurfaceBroker,
        options: CaptureOptions,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CaptureState::Idle);
        let device_lock = Arc::new(Mutex::new(()));

        let runner = Runner {
            platform,
            broker,
            options,
            events,
            state_tx,
            device_lock: Arc::clone(&device_lock),
            session: None,
            bound_target: None,
            retry_count: 0,
            retry_at: None,
        };
        tokio::spawn(runner.run(cmd_rx));

        Self { cmd_tx, state_rx, device_lock }
    }

    /// Select a device and start streaming. Resets the retry counter.
    pub fn open(&self) {
        let _ = self.cmd_tx.send(Cmd::Open);
    }

    /// Stop the stream and release the device. Idempotent; waits for the
    /// teardown to complete.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    /// The device acquisition lock. Shared so an external holder (firmware
    /// update, a second controller) serializes against open/close.
    pub fn device_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.device_lock)
    }
}

// MARK: - Runner

struct Runner {
    platform: Arc<dyn CapturePlatform>,
    broker: SurfaceBroker,
    options: CaptureOptions,
    events: mpsc::UnboundedSender<CaptureEvent>,
    state_tx: watch::Sender<CaptureState>,
    device_lock: Arc<Mutex<()>>,
    session: Option<Box<dyn DeviceSession>>,
    /// Id of the render target the open session is bound to.
    bound_target: Option<u64>,
    retry_count: u32,
    retry_at: Option<Instant>,
}

/// A receiver that is already closed; stands in while no session is open.
fn closed_device_queue() -> mpsc::Receiver<DeviceEvent> {
    let (tx, rx) = mpsc::channel(1);
    drop(tx);
    rx
}

impl Runner {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        let mut lost_rx = self.broker.on_target_lost();
        let mut device_rx = closed_device_queue();

        loop {
            // An open attempt parked on the broker can be preempted by the
            // next command; `pending` carries that command back here.
            let mut pending = tokio::select! {
                cmd = cmd_rx.recv() => Some(cmd),

                Some(ev) = device_rx.recv() => {
                    self.on_device_event(ev, &mut device_rx).await;
                    None
                }

                _ = sleep_until(self.retry_at.unwrap_or_else(Instant::now)),
                        if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.try_open(&mut device_rx, &mut cmd_rx).await
                }

                Some(_) = lost_rx.recv() => {
                    self.on_target_lost(&mut device_rx).await;
                    None
                }
            };

            while let Some(cmd) = pending.take() {
                match cmd {
                    Some(Cmd::Open) => {
                        self.retry_count = 0;
                        pending = self.try_open(&mut device_rx, &mut cmd_rx).await;
                    }
                    Some(Cmd::Close(ack)) => {
                        self.close(&mut device_rx).await;
                        let _ = ack.send(());
                    }
                    None => {
                        // Handle dropped: shut down.
                        self.close(&mut device_rx).await;
                        return;
                    }
                }
            }
        }
    }

    fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: CaptureState) {
        if self.state() != state {
            debug!("Capture state: {:?} → {:?}", self.state(), state);
            let _ = self.state_tx.send(state);
        }
    }

    fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }

    // ── Open path ─────────────────────────────────────────────────────────

    /// One open cycle. Returns a command received while the attempt was
    /// parked waiting for a render target; the caller handles it (`None`
    /// means the attempt ran to completion, success or failure).
    async fn try_open(
        &mut self,
        device_rx: &mut mpsc::Receiver<DeviceEvent>,
        cmd_rx: &mut mpsc::UnboundedReceiver<Cmd>,
    ) -> Option<Option<Cmd>> {
        // A superseded session must be fully torn down before a new open.
        self.teardown_session(device_rx).await;
        self.set_state(CaptureState::Opening);

        // The window may not have a surface yet, in which case the broker
        // parks this request. Commands must still get through: a close
        // arriving during that wait would otherwise hang shutdown.
        let target = tokio::select! {
            target = self.broker.request_target() => target,
            cmd = cmd_rx.recv() => {
                debug!("Open preempted while waiting for a render target");
                return Some(cmd);
            }
        };

        match self.open_once(&target, device_rx).await {
            Ok(()) => {
                self.set_state(CaptureState::Streaming);
                // Every transition into Streaming resets the retry counter.
                self.retry_count = 0;
                info!("Capture streaming");
                self.emit(CaptureEvent::Started);
            }
            Err(SigncastError::NoDeviceAvailable) => {
                error!("No capture device available");
                self.set_state(CaptureState::Stopped);
                self.emit(CaptureEvent::Error("No capture device available".into()));
            }
            Err(e) => {
                warn!("Capture open failed: {e}");
                self.set_state(CaptureState::Error);
                self.schedule_retry(e.to_string());
            }
        }
        None
    }

    /// One locked open attempt. The render target is resolved before this
    /// point so a parked target request never holds the device hostage; the
    /// guard is dropped on every path, success or error.
    async fn open_once(
        &mut self,
        target: &RenderTarget,
        device_rx: &mut mpsc::Receiver<DeviceEvent>,
    ) -> Result<(), SigncastError> {
        let guard = self.acquire_lock().await?;
        let result = self.open_locked(target, device_rx).await;
        drop(guard);
        result
    }

    async fn acquire_lock(&self) -> Result<OwnedMutexGuard<()>, SigncastError> {
        tokio::time::timeout(self.options.lock_timeout, Arc::clone(&self.device_lock).lock_owned())
            .await
            .map_err(|_| SigncastError::DeviceBusy)
    }

    async fn open_locked(
        &mut self,
        target: &RenderTarget,
        device_rx: &mut mpsc::Receiver<DeviceEvent>,
    ) -> Result<(), SigncastError> {
        let device = self.select_device().await?;
        info!("Opening capture device {} (external={})", device.id, device.external);

        let (mut session, events) = self.platform.open(&device.id).await?;
        self.set_state(CaptureState::Configuring);

        let negotiated = choose_optimal_size(self.options.requested_size, &device.supported_sizes);
        if negotiated != self.options.requested_size {
            debug!(
                "Requested {} unavailable; negotiated {}",
                self.options.requested_size, negotiated
            );
        }

        if let Err(e) = session.configure(target, negotiated).await {
            session.stop().await;
            return Err(e);
        }
        if let Err(e) = session.start_stream().await {
            session.stop().await;
            return Err(e);
        }

        *device_rx = events;
        self.session = Some(session);
        self.bound_target = Some(target.id);
        Ok(())
    }

    /// Prefer an external-flagged device; else the configured id; else fail.
    async fn select_device(&self) -> Result<DeviceInfo, SigncastError> {
        let devices = self.platform.enumerate().await;
        if let Some(external) = devices.iter().find(|d| d.external) {
            return Ok(external.clone());
        }
        if let Some(wanted) = &self.options.preferred_device_id {
            if let Some(device) = devices.iter().find(|d| &d.id == wanted) {
                debug!("No external device; falling back to configured id {wanted}");
                return Ok(device.clone());
            }
        }
        Err(SigncastError::NoDeviceAvailable)
    }

    // ── Failure / retry path ──────────────────────────────────────────────

    fn schedule_retry(&mut self, reason: String) {
        if self.retry_count < self.options.max_retry_attempts {
            self.retry_count += 1;
            info!(
                "Retrying capture open in {:?} (attempt {}/{})",
                self.options.retry_delay, self.retry_count, self.options.max_retry_attempts
            );
            self.retry_at = Some(Instant::now() + self.options.retry_delay);
        } else {
            error!("Max retry attempts reached; stopping capture: {reason}");
            self.retry_at = None;
            self.set_state(CaptureState::Stopped);
            self.emit(CaptureEvent::Error(reason));
        }
    }

    async fn on_device_event(
        &mut self,
        event: DeviceEvent,
        device_rx: &mut mpsc::Receiver<DeviceEvent>,
    ) {
        match event {
            DeviceEvent::Disconnected => {
                warn!("Capture device disconnected");
                self.teardown_session(device_rx).await;
                self.set_state(CaptureState::Disconnected);
                self.schedule_retry("device disconnected".into());
            }
            DeviceEvent::Error(code) => {
                let err = SigncastError::DeviceError(code);
                error!("{err}");
                self.teardown_session(device_rx).await;
                self.set_state(CaptureState::Error);
                self.schedule_retry(err.to_string());
            }
        }
    }

    async fn on_target_lost(&mut self, device_rx: &mut mpsc::Receiver<DeviceEvent>) {
        // A lost notification can arrive after an Open command already
        // rebound the session to the replacement target; that one is stale.
        if let (Some(bound), Some(current)) = (self.bound_target, self.broker.current()) {
            if current.id == bound {
                debug!("Ignoring stale target-lost notification");
                return;
            }
        }
        // Never write to a dangling target: close the session and wait for
        // the coordinator to reopen once the window is recreated.
        self.retry_at = None;
        if self.session.is_some() {
            warn!("Render target lost; closing capture session");
            let _guard = Arc::clone(&self.device_lock).lock_owned().await;
            self.teardown_session(device_rx).await;
            self.set_state(CaptureState::Idle);
            self.emit(CaptureEvent::Stopped);
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    async fn teardown_session(&mut self, device_rx: &mut mpsc::Receiver<DeviceEvent>) {
        if let Some(mut session) = self.session.take() {
            session.stop().await;
            self.bound_target = None;
            *device_rx = closed_device_queue();
        }
    }

    async fn close(&mut self, device_rx: &mut mpsc::Receiver<DeviceEvent>) {
        // Cancel any pending retry first so a timer cannot fire mid-close.
        self.retry_at = None;
        let _guard = Arc::clone(&self.device_lock).lock_owned().await;
        let had_session = self.session.is_some();
        self.teardown_session(device_rx).await;
        if self.state() != CaptureState::Stopped {
            self.set_state(CaptureState::Stopped);
            self.emit(CaptureEvent::Stopped);
        } else if had_session {
            self.emit(CaptureEvent::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::broker::{RenderTarget, TargetKind};

    use super::*;

    struct MockSession {
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeviceSession for MockSession {
        async fn configure(&mut self, _target: &RenderTarget, _size: Size) -> Result<(), SigncastError> {
            Ok(())
        }
        async fn start_stream(&mut self) -> Result<(), SigncastError> {
            Ok(())
        }
        async fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockPlatform {
        /// First N open() calls fail with a device error.
        failing_opens: usize,
        open_calls: AtomicUsize,
        stops: Arc<AtomicUsize>,
        event_tx: StdMutex<Option<mpsc::Sender<DeviceEvent>>>,
    }

    impl MockPlatform {
        fn new(failing_opens: usize) -> Arc<Self> {
            Arc::new(Self {
                failing_opens,
                open_calls: AtomicUsize::new(0),
                stops: Arc::new(AtomicUsize::new(0)),
                event_tx: StdMutex::new(None),
            })
        }

        async fn inject(&self, event: DeviceEvent) {
            let tx = self.event_tx.lock().unwrap().clone().expect("open session");
            tx.send(event).await.expect("controller listening");
        }
    }

    #[async_trait]
    impl CapturePlatform for MockPlatform {
        async fn enumerate(&self) -> Vec<DeviceInfo> {
            vec![DeviceInfo {
                id: "hdmi0".into(),
                external: true,
                supported_sizes: vec![Size::FHD, Size::HD],
            }]
        }

        async fn open(
            &self,
            _id: &str,
        ) -> Result<(Box<dyn DeviceSession>, mpsc::Receiver<DeviceEvent>), SigncastError> {
            let n = self.open_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failing_opens {
                return Err(SigncastError::DeviceError(4));
            }
            let (tx, rx) = mpsc::channel(4);
            *self.event_tx.lock().unwrap() = Some(tx);
            Ok((Box::new(MockSession { stops: Arc::clone(&self.stops) }), rx))
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<CaptureState>, want: CaptureState) {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("controller alive");
        }
    }

    fn spawn_controller(
        platform: Arc<MockPlatform>,
    ) -> (CaptureController, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = CaptureController::spawn(
            platform,
            SurfaceBroker::new(),
            CaptureOptions::default(),
            event_tx,
        );
        (controller, event_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_and_streams() {
        let platform = MockPlatform::new(0);
        let (controller, mut events) = spawn_controller(Arc::clone(&platform));

        controller.open();
        let mut state = controller.watch_state();
        wait_for_state(&mut state, CaptureState::Streaming).await;

        assert_eq!(events.recv().await, Some(CaptureEvent::Started));
        assert_eq!(platform.open_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_bound_is_terminal() {
        // Every open fails; initial attempt + 3 retries, then Stopped.
        let platform = MockPlatform::new(usize::MAX);
        let (controller, mut events) = spawn_controller(Arc::clone(&platform));

        controller.open();
        let mut state = controller.watch_state();
        wait_for_state(&mut state, CaptureState::Stopped).await;

        assert_eq!(platform.open_calls.load(Ordering::SeqCst), 4);
        // Let any (incorrect) 4th retry timer fire.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(platform.open_calls.load(Ordering::SeqCst), 4);

        assert!(matches!(events.recv().await, Some(CaptureEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_triggers_reopen_and_resets_counter() {
        let platform = MockPlatform::new(0);
        let (controller, _events) = spawn_controller(Arc::clone(&platform));

        controller.open();
        let mut state = controller.watch_state();
        wait_for_state(&mut state, CaptureState::Streaming).await;

        platform.inject(DeviceEvent::Disconnected).await;
        wait_for_state(&mut state, CaptureState::Disconnected).await;
        wait_for_state(&mut state, CaptureState::Streaming).await;

        assert_eq!(platform.open_calls.load(Ordering::SeqCst), 2);
        assert_eq!(platform.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let platform = MockPlatform::new(0);
        let (controller, mut events) = spawn_controller(Arc::clone(&platform));

        controller.open();
        let mut state = controller.watch_state();
        wait_for_state(&mut state, CaptureState::Streaming).await;
        assert_eq!(events.recv().await, Some(CaptureEvent::Started));

        controller.close().await;
        controller.close().await;

        assert_eq!(controller.state(), CaptureState::Stopped);
        assert_eq!(platform.stops.load(Ordering::SeqCst), 1);
        assert_eq!(events.recv().await, Some(CaptureEvent::Stopped));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_surfaces_device_busy_and_never_touches_device() {
        let platform = MockPlatform::new(0);
        let (controller, _events) = spawn_controller(Arc::clone(&platform));

        // External holder keeps the acquisition lock for the whole test.
        let _held = controller.device_lock().lock_owned().await;

        controller.open();
        let mut state = controller.watch_state();
        wait_for_state(&mut state, CaptureState::Stopped).await;

        assert_eq!(platform.open_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_completes_while_open_waits_for_a_target() {
        let platform = MockPlatform::new(0);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let broker = SurfaceBroker::new();
        // A window manager is attached but never supplies a surface, so the
        // open parks on the broker indefinitely.
        broker.attach_provider();

        let controller = CaptureController::spawn(
            Arc::clone(&platform) as Arc<dyn CapturePlatform>,
            broker,
            CaptureOptions::default(),
            event_tx,
        );

        controller.open();
        tokio::task::yield_now().await;

        let closed = tokio::time::timeout(Duration::from_secs(60), controller.close()).await;
        assert!(closed.is_ok());
        assert_eq!(controller.state(), CaptureState::Stopped);
        assert_eq!(platform.open_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn target_lost_closes_session() {
        let platform = MockPlatform::new(0);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let broker = SurfaceBroker::new();
        broker.attach_provider();
        broker.supply(RenderTarget { id: 1, kind: TargetKind::Window });

        let controller = CaptureController::spawn(
            Arc::clone(&platform) as Arc<dyn CapturePlatform>,
            broker.clone(),
            CaptureOptions::default(),
            event_tx,
        );

        controller.open();
        let mut state = controller.watch_state();
        wait_for_state(&mut state, CaptureState::Streaming).await;

        broker.invalidate();
        wait_for_state(&mut state, CaptureState::Idle).await;
        assert_eq!(platform.stops.load(Ordering::SeqCst), 1);
    }
}
