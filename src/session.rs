use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch, Mutex, OwnedMutexGuard, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    calibration::{CalibrationStep, CalibrationWizard, WizardInput},
    commands::{self, CommandSink},
    error::{PowerMeterError, Result},
    protocol::{decode_battery, decode_log, decode_power, encode_command},
    telemetry::{Recording, TelemetryStore},
    transport::{NotificationSource, Transport, TransportEvent},
    types::{LogEntry, MeterReadings, PowerSample, SessionConfig, SessionSnapshot, SessionState},
    BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, CONFIG_SERVICE_UUID, CONTROL_CHAR_UUID,
    LOG_CHAR_UUID, POWER_MEASUREMENT_CHAR_UUID, POWER_SERVICE_UUID, REQUIRED_SERVICES,
};

/// Link and control endpoint of an established connection
struct DeviceSession<T: Transport> {
    link: T::Link,
    control: T::Characteristic,
}

/// Connection lifecycle owned by the session; only mutated under its lock
struct Lifecycle<T: Transport> {
    state: SessionState,
    reconnect_attempts: u32,
    /// Bumped by every user-initiated connect or disconnect; background
    /// tasks holding an older value stand down.
    generation: u64,
    device: Option<T::Device>,
    session: Option<DeviceSession<T>>,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl<T: Transport> Lifecycle<T> {
    const fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            reconnect_attempts: 0,
            generation: 0,
            device: None,
            session: None,
            pump: None,
            reconnect: None,
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // Detached, not aborted: an attempt in flight sees the new generation
        // and closes whatever link it opened.
        self.reconnect = None;
    }
}

#[derive(Default)]
struct SessionData {
    readings: MeterReadings,
    telemetry: TelemetryStore,
}

struct Shared<T: Transport> {
    transport: T,
    config: SessionConfig,
    lifecycle: Mutex<Lifecycle<T>>,
    data: RwLock<SessionData>,
    wizard: Mutex<CalibrationWizard>,
    /// Held by whichever connect, reconnect attempt or link teardown is
    /// driving the transport. Always free while a session is installed.
    operation: Arc<Mutex<()>>,
    state_tx: watch::Sender<SessionState>,
    cancel_tx: watch::Sender<u64>,
}

/// Resolves once a newer connect or disconnect replaces `generation`
async fn superseded(mut cancel: watch::Receiver<u64>, generation: u64) {
    while *cancel.borrow_and_update() == generation {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Result of a successful connection establishment
struct Established<T: Transport> {
    session: DeviceSession<T>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Client session with one BLE power meter
///
/// `PowerMeterSession` owns the connection state machine, routes decoded
/// notifications into the telemetry store and supervises automatic
/// reconnection after an unexpected link loss.
///
/// # State machine
///
/// ```text
/// Disconnected --connect--> Connecting --ok--> Connected
///                                     --err--> Disconnected
/// Connected --link lost--> Reconnecting --ok--> Connected
///                                       --max attempts--> Failed
/// Failed --connect--> Connecting
/// any --disconnect--> Disconnected
/// ```
///
/// Reconnection waits a fixed delay before each attempt, re-acquires the
/// previously selected device and re-subscribes all notifications. After
/// `max_reconnect_attempts` failures the session moves to
/// [`SessionState::Failed`] and all readings are cleared.
///
/// # Examples
///
/// ```no_run
/// use wattlers::{BtleplugTransport, PowerMeterSession, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SessionConfig::default();
///     let transport = BtleplugTransport::new(&config).await?;
///     let session = PowerMeterSession::new(transport, config);
///
///     session.connect().await?;
///     session.dispatch("SCR", Some("172.5")).await?;
///
///     let snapshot = session.snapshot().await;
///     println!("{} W at {} rpm", snapshot.readings.power, snapshot.readings.cadence);
///     Ok(())
/// }
/// ```
pub struct PowerMeterSession<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> PowerMeterSession<T> {
    /// Create a disconnected session on top of `transport`
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (cancel_tx, _) = watch::channel(0);

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                lifecycle: Mutex::new(Lifecycle::new()),
                data: RwLock::new(SessionData::default()),
                wizard: Mutex::new(CalibrationWizard::new()),
                operation: Arc::new(Mutex::new(())),
                state_tx,
                cancel_tx,
            }),
        }
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Connect to a power meter
    ///
    /// Requests a device, opens the GATT link, resolves the power, battery
    /// and vendor config services and subscribes to all three notification
    /// sources. An existing connection is torn down first. Calls made while
    /// a connect or reconnection is already running are ignored.
    ///
    /// Failures are returned to the caller and never retried automatically.
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::DeviceUnavailable`],
    /// [`PowerMeterError::LinkUnavailable`], [`PowerMeterError::ServiceNotFound`],
    /// [`PowerMeterError::CharacteristicNotFound`] or
    /// [`PowerMeterError::SubscribeFailed`] depending on the failing step.
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// Disconnect from the power meter
    ///
    /// Aborts any running reconnection or connect immediately and returns
    /// once the current link is closed. Readings and telemetry
    /// are kept; use [`Self::reset_readings`] to clear them.
    ///
    /// # Errors
    ///
    /// Returns transport errors from closing the link. The session is
    /// [`SessionState::Disconnected`] regardless.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.disconnect().await
    }

    /// Current connection state
    pub async fn state(&self) -> SessionState {
        self.shared.lifecycle.lock().await.state
    }

    /// Current reconnect attempt count
    pub async fn reconnect_attempts(&self) -> u32 {
        self.shared.lifecycle.lock().await.reconnect_attempts
    }

    /// Watch connection state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Read model for presentation
    pub async fn snapshot(&self) -> SessionSnapshot {
        let (state, reconnect_attempt) = {
            let lifecycle = self.shared.lifecycle.lock().await;
            (lifecycle.state, lifecycle.reconnect_attempts)
        };
        let data = self.shared.data.read().await;

        SessionSnapshot {
            state,
            reconnect_attempt,
            max_reconnect_attempts: self.shared.config.max_reconnect_attempts,
            readings: data.readings.clone(),
            telemetry_window: data.telemetry.window().points(),
            recording: data.telemetry.recording_status(),
        }
    }

    /// Latest readings and logs
    pub async fn readings(&self) -> MeterReadings {
        self.shared.data.read().await.readings.clone()
    }

    /// Return readings, logs and telemetry to their initial defaults
    pub async fn reset_readings(&self) {
        self.shared.reset_data().await;
    }

    /// Validate and send a catalog or custom command
    ///
    /// Returns the command string that was written.
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::MissingParameter`] or
    /// [`PowerMeterError::InvalidInput`] without writing anything, or any
    /// error from [`CommandSink::send_command`].
    pub async fn dispatch(&self, mnemonic: &str, value: Option<&str>) -> Result<String> {
        commands::dispatch(self, mnemonic, value).await
    }

    /// Start recording power samples
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::AlreadyRecording`] if one is running.
    pub async fn start_recording(&self) -> Result<()> {
        self.shared.data.write().await.telemetry.start_recording()
    }

    /// Stop recording and return the frozen recording
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::NotRecording`] if none is running.
    pub async fn stop_recording(&self) -> Result<Recording> {
        self.shared.data.write().await.telemetry.stop_recording()
    }

    /// Most recently stopped recording
    pub async fn last_recording(&self) -> Option<Recording> {
        self.shared.data.read().await.telemetry.last_recording().cloned()
    }

    /// Current calibration wizard state
    pub async fn wizard(&self) -> CalibrationWizard {
        self.shared.wizard.lock().await.clone()
    }

    /// Apply optional input and advance the calibration wizard
    ///
    /// # Errors
    ///
    /// Returns [`PowerMeterError::InvalidInput`] for a missing or invalid
    /// weight, or [`PowerMeterError::NotConnected`] and write errors from
    /// the step's command. The wizard stays on its step on error.
    pub async fn advance_wizard(&self, input: Option<WizardInput>) -> Result<CalibrationStep> {
        let mut wizard = self.shared.wizard.lock().await;
        if let Some(input) = input {
            wizard.apply_input(input);
        }
        wizard.advance(self).await
    }

    /// Abandon the calibration wizard
    pub async fn reset_wizard(&self) {
        self.shared.wizard.lock().await.reset();
    }
}

#[async_trait]
impl<T: Transport> CommandSink for PowerMeterSession<T> {
    /// Write a command to the vendor control characteristic
    ///
    /// Commands are never queued: outside [`SessionState::Connected`] this
    /// fails with [`PowerMeterError::NotConnected`] and writes nothing.
    async fn send_command(&self, command: &str) -> Result<()> {
        let control = {
            let lifecycle = self.shared.lifecycle.lock().await;
            match (lifecycle.state, lifecycle.session.as_ref()) {
                (SessionState::Connected, Some(session)) => session.control.clone(),
                _ => return Err(PowerMeterError::NotConnected),
            }
        };

        debug!(command, "Sending command");
        self.shared
            .transport
            .write_value(&control, encode_command(command))
            .await
    }
}

impl<T: Transport> Drop for PowerMeterSession<T> {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = shared.disconnect().await;
            });
        }
    }
}

impl<T: Transport> Shared<T> {
    fn publish(&self, lifecycle: &mut Lifecycle<T>, state: SessionState) {
        lifecycle.state = state;
        self.state_tx.send_replace(state);
    }

    /// Check if `generation` is still the latest connect or disconnect
    fn is_current(&self, generation: u64) -> bool {
        *self.cancel_tx.borrow() == generation
    }

    fn try_claim(&self) -> Option<OwnedMutexGuard<()>> {
        self.operation.clone().try_lock_owned().ok()
    }

    async fn claim(&self, early: Option<OwnedMutexGuard<()>>) -> OwnedMutexGuard<()> {
        match early {
            Some(guard) => guard,
            None => self.operation.clone().lock_owned().await,
        }
    }

    async fn reset_data(&self) {
        let mut data = self.data.write().await;
        data.readings = MeterReadings::default();
        data.telemetry.reset();
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let (generation, stale, early) = {
            let mut lifecycle = self.lifecycle.lock().await;
            if !lifecycle.state.accepts_connect() {
                debug!(state = %lifecycle.state, "Ignoring connect request");
                return Ok(());
            }

            lifecycle.generation += 1;
            self.cancel_tx.send_replace(lifecycle.generation);
            lifecycle.stop_tasks();
            lifecycle.reconnect_attempts = 0;
            lifecycle.device = None;
            let stale = lifecycle.session.take();
            let early = self.try_claim();
            self.publish(&mut lifecycle, SessionState::Connecting);
            (lifecycle.generation, stale, early)
        };

        // Waits for a superseded operation to finish closing its own link.
        let operation = self.claim(early).await;

        if let Some(stale) = stale {
            info!("Closing existing link before reconnecting");
            if let Err(e) = self.transport.disconnect_link(&stale.link).await {
                warn!("Failed to close existing link: {}", e);
            }
        }
        if !self.is_current(generation) {
            debug!("Connect superseded before it started");
            return Ok(());
        }

        info!("Connecting to power meter");
        let result = async {
            let device = self.transport.request_device(&REQUIRED_SERVICES).await?;
            let established = self.establish(&device, generation).await?;
            Ok::<_, PowerMeterError>((device, established))
        }
        .await;

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation != generation {
            drop(lifecycle);
            info!("Connect superseded by a newer request");
            if let Ok((_, established)) = result {
                let _ = self
                    .transport
                    .disconnect_link(&established.session.link)
                    .await;
            }
            return Ok(());
        }

        match result {
            Ok((device, established)) => {
                lifecycle.device = Some(device);
                self.install(&mut lifecycle, generation, established);
                drop(operation);
                info!("Connected to power meter");
                Ok(())
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                self.publish(&mut lifecycle, SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let (stale, early) = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.generation += 1;
            self.cancel_tx.send_replace(lifecycle.generation);
            lifecycle.stop_tasks();
            lifecycle.reconnect_attempts = 0;
            lifecycle.device = None;
            let stale = lifecycle.session.take();
            let early = stale.as_ref().and_then(|_| self.try_claim());
            if lifecycle.state != SessionState::Disconnected {
                info!(from = %lifecycle.state, "Disconnecting from power meter");
            }
            self.publish(&mut lifecycle, SessionState::Disconnected);
            (stale, early)
        };

        if let Some(stale) = stale {
            let _operation = self.claim(early).await;
            self.transport.disconnect_link(&stale.link).await?;
        }
        Ok(())
    }

    /// Open the link, resolve all endpoints and subscribe all notifications
    ///
    /// Gives up with [`PowerMeterError::Superseded`] as soon as `generation`
    /// is replaced. The link is closed on every failure.
    async fn establish(&self, device: &T::Device, generation: u64) -> Result<Established<T>> {
        let link = self.transport.connect_link(device).await?;

        let subscribed = tokio::select! {
            result = self.subscribe_all(&link) => result,
            () = superseded(self.cancel_tx.subscribe(), generation) => {
                Err(PowerMeterError::Superseded)
            }
        };

        match subscribed {
            Ok((control, events)) => Ok(Established {
                session: DeviceSession { link, control },
                events,
            }),
            Err(e) => {
                let _ = self.transport.disconnect_link(&link).await;
                Err(e)
            }
        }
    }

    async fn subscribe_all(
        &self,
        link: &T::Link,
    ) -> Result<(T::Characteristic, mpsc::UnboundedReceiver<TransportEvent>)> {
        let transport = &self.transport;

        let power_service = transport.get_service(link, POWER_SERVICE_UUID).await?;
        let config_service = transport.get_service(link, CONFIG_SERVICE_UUID).await?;
        let battery_service = transport.get_service(link, BATTERY_SERVICE_UUID).await?;

        let power_char = transport
            .get_characteristic(&power_service, POWER_MEASUREMENT_CHAR_UUID)
            .await?;
        let battery_char = transport
            .get_characteristic(&battery_service, BATTERY_LEVEL_CHAR_UUID)
            .await?;
        let log_char = transport
            .get_characteristic(&config_service, LOG_CHAR_UUID)
            .await?;
        let control_char = transport
            .get_characteristic(&config_service, CONTROL_CHAR_UUID)
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        transport.on_disconnected(link, events_tx.clone()).await?;

        transport
            .subscribe(&power_char, NotificationSource::Power, events_tx.clone())
            .await?;
        transport
            .subscribe(&battery_char, NotificationSource::Battery, events_tx.clone())
            .await?;
        transport
            .subscribe(&log_char, NotificationSource::Log, events_tx)
            .await?;

        Ok((control_char, events_rx))
    }

    /// Enter `Connected` with a fresh notification pump
    fn install(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle<T>,
        generation: u64,
        established: Established<T>,
    ) {
        lifecycle.reconnect_attempts = 0;
        lifecycle.session = Some(established.session);
        lifecycle.pump = Some(tokio::spawn(
            self.clone().pump(generation, established.events),
        ));
        self.publish(lifecycle, SessionState::Connected);
    }

    /// Process transport events in arrival order until the link drops
    async fn pump(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Notification { source, value } => {
                    self.route(source, &value).await;
                }
                TransportEvent::Disconnected => {
                    self.on_link_lost(generation).await;
                    break;
                }
            }
        }
    }

    async fn route(&self, source: NotificationSource, value: &[u8]) {
        match source {
            NotificationSource::Power => match decode_power(value) {
                Ok(reading) => {
                    let mut data = self.data.write().await;
                    data.readings.power = reading.power;
                    data.readings.cadence = reading.cadence;
                    data.telemetry.on_power_sample(PowerSample::now(reading));
                }
                Err(e) => warn!("Dropping power notification: {}", e),
            },
            NotificationSource::Battery => match decode_battery(value) {
                Ok(percent) => self.data.write().await.readings.battery_percent = percent,
                Err(e) => warn!("Dropping battery notification: {}", e),
            },
            NotificationSource::Log => {
                let message = decode_log(value);
                debug!(message = %message, "Device log");
                self.data
                    .write()
                    .await
                    .readings
                    .push_log(LogEntry::new(message), self.config.log_capacity);
            }
        }
    }

    async fn on_link_lost(self: &Arc<Self>, generation: u64) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.generation != generation || lifecycle.state != SessionState::Connected {
            return;
        }

        warn!("Power meter disconnected unexpectedly");
        lifecycle.pump = None;
        let stale = lifecycle
            .session
            .take()
            .map(|session| (session.link, self.try_claim()));
        self.publish(&mut lifecycle, SessionState::Reconnecting);

        lifecycle.reconnect = Some(tokio::spawn(self.clone().reconnect(generation, stale)));
    }

    /// Bounded reconnection with a fixed delay before each attempt
    async fn reconnect(
        self: Arc<Self>,
        generation: u64,
        stale: Option<(T::Link, Option<OwnedMutexGuard<()>>)>,
    ) {
        if let Some((link, early)) = stale {
            let _operation = self.claim(early).await;
            let _ = self.transport.disconnect_link(&link).await;
        }

        let max = self.config.max_reconnect_attempts;
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);

        loop {
            let device = {
                let mut lifecycle = self.lifecycle.lock().await;
                if lifecycle.generation != generation
                    || lifecycle.state != SessionState::Reconnecting
                {
                    return;
                }
                if lifecycle.reconnect_attempts >= max {
                    let exhausted = PowerMeterError::MaxReconnectAttemptsExceeded {
                        attempts: lifecycle.reconnect_attempts,
                    };
                    error!("{}", exhausted);
                    lifecycle.device = None;
                    lifecycle.reconnect = None;
                    self.reset_data().await;
                    self.publish(&mut lifecycle, SessionState::Failed);
                    return;
                }
                info!(
                    attempt = lifecycle.reconnect_attempts + 1,
                    max, "Reconnection attempt scheduled"
                );
                match lifecycle.device.clone() {
                    Some(device) => device,
                    None => return,
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = superseded(self.cancel_tx.subscribe(), generation) => return,
            }

            let operation = self.claim(None).await;
            if !self.is_current(generation) {
                return;
            }
            let result = self.reacquire(&device, generation).await;

            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.generation != generation || lifecycle.state != SessionState::Reconnecting {
                drop(lifecycle);
                if let Ok(established) = result {
                    let _ = self
                        .transport
                        .disconnect_link(&established.session.link)
                        .await;
                }
                return;
            }

            match result {
                Ok(established) => {
                    lifecycle.reconnect = None;
                    self.install(&mut lifecycle, generation, established);
                    drop(operation);
                    info!("Reconnection successful");
                    return;
                }
                Err(e) => {
                    lifecycle.reconnect_attempts += 1;
                    warn!(
                        attempt = lifecycle.reconnect_attempts,
                        max, "Reconnection attempt failed: {}", e
                    );
                    // Wake watchers so the attempt counter is re-read.
                    self.state_tx.send_replace(lifecycle.state);
                }
            }
        }
    }

    async fn reacquire(&self, previous: &T::Device, generation: u64) -> Result<Established<T>> {
        let device = self.transport.paired_device(previous).await?;
        self.establish(&device, generation).await
    }
}
