//! Central Engine: scanner and GATT client
//!
//! Scanning filters sightings through the discovery table. Links are opened on
//! demand; the first read or write on a link triggers service discovery and
//! any operation issued meanwhile is deferred until it completes. In-flight
//! reads and writes are keyed by `(device, characteristic)`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_core::{
    advertisement, AdvertisementPayload, BleEvent, DeviceId, DiscoveredDevice, DiscoveryTable,
    EventSink, HandshakeMessage, LinkState, OperationError, RadioState, Result, TetherError,
    UserHash, HANDSHAKE_CHARACTERISTIC_UUID, PROFILE_CHARACTERISTIC_UUID,
};

use crate::config::BleConfig;
use crate::pending::{GattKey, PendingOps};
use crate::radio::{CentralInput, CentralRadio, InputSender};

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

enum CentralCommand {
    StartScan {
        respond: oneshot::Sender<Result<()>>,
    },
    StopScan {
        respond: oneshot::Sender<Result<()>>,
    },
    Connect {
        device_id: DeviceId,
        timeout: Option<Duration>,
        respond: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        device_id: DeviceId,
        respond: oneshot::Sender<Result<()>>,
    },
    Gatt {
        device_id: DeviceId,
        op: GattOp,
    },
    DiscoveredDevices {
        respond: oneshot::Sender<Result<Vec<DiscoveredDevice>>>,
    },
    FindByUserHash {
        user_hash: UserHash,
        respond: oneshot::Sender<Result<Option<DiscoveredDevice>>>,
    },
    Status {
        respond: oneshot::Sender<Result<CentralStatus>>,
    },
    Shutdown,
}

/// Snapshot of the engine for diagnostics
#[derive(Debug, Clone)]
pub struct CentralStatus {
    pub radio_state: RadioState,
    pub scanning: bool,
    pub scan_session: u64,
    pub discovered: usize,
    pub connected: Vec<DeviceId>,
}

enum GattOp {
    Read {
        characteristic: Uuid,
        respond: oneshot::Sender<Result<Vec<u8>>>,
    },
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
        respond: oneshot::Sender<Result<()>>,
    },
}

impl GattOp {
    fn characteristic(&self) -> Uuid {
        match self {
            GattOp::Read { characteristic, .. } | GattOp::Write { characteristic, .. } => {
                *characteristic
            }
        }
    }

    fn fail(self, error: TetherError) {
        match self {
            GattOp::Read { respond, .. } => {
                let _ = respond.send(Err(error));
            }
            GattOp::Write { respond, .. } => {
                let _ = respond.send(Err(error));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to a running central engine
#[derive(Clone)]
pub struct CentralHandle {
    commands: mpsc::Sender<CentralCommand>,
    inputs: InputSender<CentralInput>,
}

impl CentralHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> CentralCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| TetherError::channel_error("central engine stopped"))?;
        rx.await
            .map_err(|_| TetherError::channel_error("central engine dropped the request"))?
    }

    pub async fn start_scan(&self) -> Result<()> {
        self.request(|respond| CentralCommand::StartScan { respond })
            .await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(|respond| CentralCommand::StopScan { respond })
            .await
    }

    /// Connect to a discovered device; `None` uses the configured timeout
    pub async fn connect(&self, device_id: &DeviceId, timeout: Option<Duration>) -> Result<()> {
        let device_id = device_id.clone();
        self.request(|respond| CentralCommand::Connect {
            device_id,
            timeout,
            respond,
        })
        .await
    }

    pub async fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        let device_id = device_id.clone();
        self.request(|respond| CentralCommand::Disconnect { device_id, respond })
            .await
    }

    pub async fn read(&self, device_id: &DeviceId, characteristic: Uuid) -> Result<Vec<u8>> {
        let device_id = device_id.clone();
        self.request(|respond| CentralCommand::Gatt {
            device_id,
            op: GattOp::Read {
                characteristic,
                respond,
            },
        })
        .await
    }

    pub async fn write(&self, device_id: &DeviceId, characteristic: Uuid, value: Vec<u8>) -> Result<()> {
        let device_id = device_id.clone();
        self.request(|respond| CentralCommand::Gatt {
            device_id,
            op: GattOp::Write {
                characteristic,
                value,
                respond,
            },
        })
        .await
    }

    /// Read the peer's Profile characteristic
    pub async fn read_profile(&self, device_id: &DeviceId) -> Result<Vec<u8>> {
        self.read(device_id, PROFILE_CHARACTERISTIC_UUID).await
    }

    /// Write a handshake envelope to the peer's Handshake characteristic
    pub async fn write_handshake(&self, device_id: &DeviceId, message: &HandshakeMessage) -> Result<()> {
        let value = message.to_bytes()?;
        self.write(device_id, HANDSHAKE_CHARACTERISTIC_UUID, value)
            .await
    }

    pub async fn discovered_devices(&self) -> Result<Vec<DiscoveredDevice>> {
        self.request(|respond| CentralCommand::DiscoveredDevices { respond })
            .await
    }

    pub async fn find_by_user_hash(&self, user_hash: UserHash) -> Result<Option<DiscoveredDevice>> {
        self.request(|respond| CentralCommand::FindByUserHash { user_hash, respond })
            .await
    }

    pub async fn status(&self) -> Result<CentralStatus> {
        self.request(|respond| CentralCommand::Status { respond })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(CentralCommand::Shutdown).await;
    }

    /// Input channel into the engine, for shims and test harnesses
    pub fn input_sender(&self) -> InputSender<CentralInput> {
        self.inputs.clone()
    }
}

// ----------------------------------------------------------------------------
// Links
// ----------------------------------------------------------------------------

enum LinkPhase {
    Connecting { attempt: u64, timeout_ms: u64 },
    Connected,
}

enum ServicePhase {
    Unknown,
    Discovering,
    Discovered(Vec<Uuid>),
}

struct Link {
    phase: LinkPhase,
    services: ServicePhase,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    disconnect_waiters: Vec<oneshot::Sender<Result<()>>>,
    deferred: Vec<GattOp>,
}

impl Link {
    fn connecting(attempt: u64, timeout_ms: u64, respond: oneshot::Sender<Result<()>>) -> Self {
        Self {
            phase: LinkPhase::Connecting {
                attempt,
                timeout_ms,
            },
            services: ServicePhase::Unknown,
            connect_waiters: vec![respond],
            disconnect_waiters: Vec::new(),
            deferred: Vec::new(),
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.phase, LinkPhase::Connected)
    }
}

/// What to do with a GATT operation once the link has been inspected
enum Dispatch {
    Fail(GattOp, TetherError),
    Discover,
    Submit(GattOp),
    Deferred,
}

/// Prefer manufacturer data, then the local-name fallback, then unknown
fn decode_sighting(manufacturer_data: Option<&[u8]>, local_name: Option<&str>) -> AdvertisementPayload {
    manufacturer_data
        .map(advertisement::decode)
        .filter(AdvertisementPayload::is_known)
        .or_else(|| {
            local_name
                .map(AdvertisementPayload::from_name_string)
                .filter(AdvertisementPayload::is_known)
        })
        .unwrap_or_else(AdvertisementPayload::unknown)
}

// ----------------------------------------------------------------------------
// Engine Task
// ----------------------------------------------------------------------------

/// Owns scan, discovery and link state; every change goes through `run`
pub struct CentralEngine<R> {
    radio: R,
    events: EventSink,
    radio_state: RadioState,
    scanning: bool,
    scan_wanted: bool,
    scan_session: u64,
    scan_waiters: Vec<oneshot::Sender<Result<()>>>,
    scan_duration: Option<Duration>,
    connect_timeout: Duration,
    connect_attempts: u64,
    discovery: DiscoveryTable,
    links: HashMap<DeviceId, Link>,
    reads: PendingOps<Vec<u8>>,
    writes: PendingOps<()>,
    command_receiver: mpsc::Receiver<CentralCommand>,
    input_receiver: mpsc::UnboundedReceiver<CentralInput>,
    input_sender: InputSender<CentralInput>,
    running: bool,
}

impl<R: CentralRadio> CentralEngine<R> {
    /// Spawn the engine on the current runtime
    pub fn spawn(radio: R, events: EventSink, config: &BleConfig) -> CentralHandle {
        let (command_sender, command_receiver) = mpsc::channel(config.command_buffer.max(1));
        let (input_sender, input_receiver) = mpsc::unbounded_channel();

        let engine = Self {
            radio,
            events,
            radio_state: RadioState::Unknown,
            scanning: false,
            scan_wanted: false,
            scan_session: 0,
            scan_waiters: Vec::new(),
            scan_duration: config.scan_duration(),
            connect_timeout: config.connect_timeout(),
            connect_attempts: 0,
            discovery: DiscoveryTable::new(config.rssi_threshold, config.device_ttl()),
            links: HashMap::new(),
            reads: PendingOps::default(),
            writes: PendingOps::default(),
            command_receiver,
            input_receiver,
            input_sender: input_sender.clone(),
            running: true,
        };
        tokio::spawn(engine.run());

        CentralHandle {
            commands: command_sender,
            inputs: input_sender,
        }
    }

    async fn run(mut self) {
        if let Err(e) = self.radio.power_on(self.input_sender.clone()).await {
            error!("Central radio failed to start: {}", e);
            self.events.emit_error(&e);
            if let TetherError::Radio(radio) = &e {
                self.radio_state = RadioState::from(radio);
            }
        }

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Central command channel closed, shutting down");
                        break;
                    }
                },
                Some(input) = self.input_receiver.recv() => self.handle_input(input).await,
            }
        }

        if self.scanning {
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Failed to stop scan on shutdown: {}", e);
            }
        }
        let devices: Vec<DeviceId> = self.links.keys().cloned().collect();
        for device_id in devices {
            if let Err(e) = self.radio.disconnect(&device_id).await {
                warn!(device_id = %device_id, "Failed to disconnect on shutdown: {}", e);
            }
        }
        info!("Central engine stopped");
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: CentralCommand) {
        match command {
            CentralCommand::StartScan { respond } => self.start_scan(respond).await,
            CentralCommand::StopScan { respond } => {
                self.stop_scan().await;
                let _ = respond.send(Ok(()));
            }
            CentralCommand::Connect {
                device_id,
                timeout,
                respond,
            } => self.connect(device_id, timeout, respond).await,
            CentralCommand::Disconnect { device_id, respond } => {
                self.disconnect(device_id, respond).await
            }
            CentralCommand::Gatt { device_id, op } => self.gatt(device_id, op).await,
            CentralCommand::DiscoveredDevices { respond } => {
                let mut devices: Vec<DiscoveredDevice> = self.discovery.devices().cloned().collect();
                devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
                let _ = respond.send(Ok(devices));
            }
            CentralCommand::FindByUserHash { user_hash, respond } => {
                let _ = respond.send(Ok(self.discovery.find_by_user_hash(&user_hash).cloned()));
            }
            CentralCommand::Status { respond } => {
                let connected = self
                    .links
                    .iter()
                    .filter(|(_, link)| link.is_connected())
                    .map(|(device_id, _)| device_id.clone())
                    .collect();
                let _ = respond.send(Ok(CentralStatus {
                    radio_state: self.radio_state,
                    scanning: self.scanning,
                    scan_session: self.scan_session,
                    discovered: self.discovery.len(),
                    connected,
                }));
            }
            CentralCommand::Shutdown => {
                self.running = false;
            }
        }
    }

    async fn start_scan(&mut self, respond: oneshot::Sender<Result<()>>) {
        if let Some(err) = self.radio_state.to_error() {
            let _ = respond.send(Err(err.into()));
            return;
        }
        if self.scanning {
            let _ = respond.send(Ok(()));
            return;
        }
        self.scan_wanted = true;
        self.scan_waiters.push(respond);
        if self.radio_state.is_ready() {
            self.begin_scan().await;
        } else {
            debug!(radio_state = ?self.radio_state, "Scan queued until the radio is ready");
        }
    }

    /// Start a new session and answer everyone waiting for one
    async fn begin_scan(&mut self) {
        let result = self.radio.start_scan().await;
        match &result {
            Ok(()) => {
                self.scanning = true;
                self.scan_session += 1;
                self.discovery.begin_session();
                info!(session = self.scan_session, "Scan started");

                if let Some(duration) = self.scan_duration {
                    let inputs = self.input_sender.clone();
                    let session = self.scan_session;
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        let _ = inputs.send(CentralInput::ScanTimeout { session });
                    });
                }
            }
            Err(e) => {
                error!("Failed to start scan: {}", e);
                self.scan_wanted = false;
            }
        }

        let waiters = std::mem::take(&mut self.scan_waiters);
        match result {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                let message = e.to_string();
                let mut waiters = waiters.into_iter();
                if let Some(first) = waiters.next() {
                    let _ = first.send(Err(e));
                } else {
                    self.events.emit_error(&e);
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(TetherError::platform(message.clone())));
                }
            }
        }
    }

    async fn stop_scan(&mut self) {
        self.scan_wanted = false;
        for waiter in self.scan_waiters.drain(..) {
            let _ = waiter.send(Err(OperationError::Superseded.into()));
        }
        if !self.scanning {
            return;
        }
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.scanning = false;
        info!(session = self.scan_session, "Scan stopped");
        self.events.emit(BleEvent::ScanStopped);
    }

    async fn connect(
        &mut self,
        device_id: DeviceId,
        timeout: Option<Duration>,
        respond: oneshot::Sender<Result<()>>,
    ) {
        if let Some(err) = self.radio_state.to_error() {
            let _ = respond.send(Err(err.into()));
            return;
        }
        if let Some(link) = self.links.get_mut(&device_id) {
            match link.phase {
                LinkPhase::Connected => {
                    let _ = respond.send(Ok(()));
                }
                LinkPhase::Connecting { .. } => link.connect_waiters.push(respond),
            }
            return;
        }
        if self.discovery.get(&device_id).is_none() {
            let _ = respond.send(Err(OperationError::DeviceNotFound {
                device_id: device_id.to_string(),
            }
            .into()));
            return;
        }

        self.emit_link(&device_id, LinkState::Connecting);
        if let Err(e) = self.radio.connect(&device_id).await {
            warn!(device_id = %device_id, "Connect submission failed: {}", e);
            self.emit_link(&device_id, LinkState::Failed);
            let _ = respond.send(Err(e));
            return;
        }

        self.connect_attempts += 1;
        let attempt = self.connect_attempts;
        let timeout = timeout.unwrap_or(self.connect_timeout);
        let timeout_ms = timeout.as_millis() as u64;
        self.links
            .insert(device_id.clone(), Link::connecting(attempt, timeout_ms, respond));

        if !timeout.is_zero() {
            let inputs = self.input_sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = inputs.send(CentralInput::ConnectTimeout { device_id, attempt });
            });
        }
    }

    async fn disconnect(&mut self, device_id: DeviceId, respond: oneshot::Sender<Result<()>>) {
        let Some(link) = self.links.get_mut(&device_id) else {
            let _ = respond.send(Ok(()));
            return;
        };
        link.disconnect_waiters.push(respond);
        if let Err(e) = self.radio.disconnect(&device_id).await {
            warn!(device_id = %device_id, "Disconnect submission failed: {}", e);
            if let Some(link) = self.links.get_mut(&device_id) {
                for waiter in link.disconnect_waiters.drain(..) {
                    let _ = waiter.send(Err(TetherError::platform(e.to_string())));
                }
            }
        }
    }

    async fn gatt(&mut self, device_id: DeviceId, op: GattOp) {
        let dispatch = match self.links.get_mut(&device_id) {
            Some(link) if link.is_connected() => match &link.services {
                ServicePhase::Unknown => {
                    link.services = ServicePhase::Discovering;
                    link.deferred.push(op);
                    Dispatch::Discover
                }
                ServicePhase::Discovering => {
                    link.deferred.push(op);
                    Dispatch::Deferred
                }
                ServicePhase::Discovered(characteristics) => {
                    if characteristics.contains(&op.characteristic()) {
                        Dispatch::Submit(op)
                    } else {
                        let err = OperationError::CharacteristicNotFound {
                            device_id: device_id.to_string(),
                            characteristic: op.characteristic().to_string(),
                        };
                        Dispatch::Fail(op, err.into())
                    }
                }
            },
            _ => Dispatch::Fail(op, TetherError::not_connected(device_id.as_str())),
        };

        match dispatch {
            Dispatch::Fail(op, err) => op.fail(err),
            Dispatch::Deferred => {}
            Dispatch::Discover => {
                debug!(device_id = %device_id, "Discovering services");
                if let Err(e) = self.radio.discover_services(&device_id).await {
                    self.fail_discovery(&device_id, &e);
                }
            }
            Dispatch::Submit(op) => self.submit(device_id, op).await,
        }
    }

    async fn submit(&mut self, device_id: DeviceId, op: GattOp) {
        match op {
            GattOp::Read {
                characteristic,
                respond,
            } => match self.radio.read(&device_id, characteristic).await {
                Ok(()) => self.reads.push(GattKey::new(device_id, characteristic), respond),
                Err(e) => {
                    let _ = respond.send(Err(e));
                }
            },
            GattOp::Write {
                characteristic,
                value,
                respond,
            } => match self.radio.write(&device_id, characteristic, value).await {
                Ok(()) => self.writes.push(GattKey::new(device_id, characteristic), respond),
                Err(e) => {
                    let _ = respond.send(Err(e));
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Radio Inputs
    // ------------------------------------------------------------------------

    async fn handle_input(&mut self, input: CentralInput) {
        match input {
            CentralInput::StateChanged(state) => self.on_state_changed(state).await,
            CentralInput::Advertisement {
                device_id,
                rssi,
                manufacturer_data,
                local_name,
            } => self.on_advertisement(device_id, rssi, manufacturer_data, local_name),
            CentralInput::Connected { device_id } => self.on_connected(device_id),
            CentralInput::ConnectFailed { device_id, reason } => {
                let Some(link) = self.links.remove(&device_id) else {
                    debug!(device_id = %device_id, "Connect failure for unknown link");
                    return;
                };
                warn!(device_id = %device_id, "Connect failed: {}", reason);
                for waiter in link.connect_waiters {
                    let _ = waiter.send(Err(TetherError::platform(reason.clone())));
                }
                self.emit_link(&device_id, LinkState::Failed);
            }
            CentralInput::ConnectTimeout { device_id, attempt } => {
                self.on_connect_timeout(device_id, attempt).await
            }
            CentralInput::Disconnected { device_id } => self.on_disconnected(device_id),
            CentralInput::ServicesDiscovered { device_id, result } => {
                self.on_services_discovered(device_id, result).await
            }
            CentralInput::ReadComplete {
                device_id,
                characteristic,
                result,
            } => {
                let key = GattKey::new(device_id, characteristic);
                if !self.reads.resolve(&key, result) {
                    debug!(device_id = %key.device_id, "Read completion with nothing pending");
                }
            }
            CentralInput::WriteComplete {
                device_id,
                characteristic,
                result,
            } => {
                let key = GattKey::new(device_id, characteristic);
                if !self.writes.resolve(&key, result) {
                    debug!(device_id = %key.device_id, "Write completion with nothing pending");
                }
            }
            CentralInput::ScanTimeout { session } => {
                if self.scanning && session == self.scan_session {
                    info!(session, "Scan duration elapsed");
                    self.stop_scan().await;
                }
            }
        }
    }

    async fn on_state_changed(&mut self, state: RadioState) {
        debug!(from = ?self.radio_state, to = ?state, "Central radio state changed");
        self.radio_state = state;

        if state.is_ready() {
            if self.scan_wanted && !self.scanning {
                self.begin_scan().await;
            }
            return;
        }

        if let Some(radio_error) = state.to_error() {
            let err = TetherError::from(radio_error.clone());
            error!("Central radio unavailable: {}", err);
            self.scan_wanted = false;
            for waiter in self.scan_waiters.drain(..) {
                let _ = waiter.send(Err(radio_error.clone().into()));
            }
            if self.scanning {
                self.scanning = false;
                self.events.emit(BleEvent::ScanStopped);
            }
            self.drop_links();
            self.events.emit_error(&err);
        } else {
            // Resetting: the platform drops the scan and every link
            if self.scanning {
                warn!("Radio resetting; scan will resume when powered on");
                self.scanning = false;
            }
            if !self.links.is_empty() {
                warn!(links = self.links.len(), "Radio resetting; dropping links");
            }
            self.drop_links();
        }
    }

    /// Tear down every link as if each had disconnected
    fn drop_links(&mut self) {
        let devices: Vec<DeviceId> = self.links.keys().cloned().collect();
        for device_id in devices {
            self.on_disconnected(device_id);
        }
    }

    fn on_advertisement(
        &mut self,
        device_id: DeviceId,
        rssi: i16,
        manufacturer_data: Option<Vec<u8>>,
        local_name: Option<String>,
    ) {
        if !self.scanning {
            return;
        }
        let now = Utc::now();
        for evicted in self.discovery.evict_stale(now) {
            debug!(device_id = %evicted, "Discovered device expired");
        }

        let payload = decode_sighting(manufacturer_data.as_deref(), local_name.as_deref());
        if let Some(device) = self.discovery.observe(device_id, rssi, payload, now) {
            debug!(
                device_id = %device.device_id,
                rssi,
                known = device.payload.is_known(),
                "Device discovered"
            );
            let event = BleEvent::DeviceDiscovered {
                device_id: device.device_id.clone(),
                rssi: device.rssi,
                payload: device.payload.clone(),
            };
            self.events.emit(event);
        }
    }

    fn on_connected(&mut self, device_id: DeviceId) {
        let Some(link) = self.links.get_mut(&device_id) else {
            debug!(device_id = %device_id, "Connected event for unknown link");
            return;
        };
        if link.is_connected() {
            return;
        }
        link.phase = LinkPhase::Connected;
        for waiter in link.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        info!(device_id = %device_id, "Connected");
        self.emit_link(&device_id, LinkState::Connected);
    }

    async fn on_connect_timeout(&mut self, device_id: DeviceId, attempt: u64) {
        let timeout_ms = match self.links.get(&device_id).map(|link| &link.phase) {
            Some(LinkPhase::Connecting {
                attempt: current,
                timeout_ms,
            }) if *current == attempt => *timeout_ms,
            _ => return,
        };
        let Some(link) = self.links.remove(&device_id) else {
            return;
        };

        warn!(device_id = %device_id, timeout_ms, "Connect timed out");
        for waiter in link.connect_waiters {
            let _ = waiter.send(Err(TetherError::timeout(timeout_ms)));
        }
        for waiter in link.disconnect_waiters {
            let _ = waiter.send(Ok(()));
        }
        self.emit_link(&device_id, LinkState::Failed);
        if let Err(e) = self.radio.disconnect(&device_id).await {
            warn!(device_id = %device_id, "Failed to cancel connect attempt: {}", e);
        }
    }

    fn on_disconnected(&mut self, device_id: DeviceId) {
        let failed_reads = self
            .reads
            .fail_device(&device_id, || TetherError::disconnected(device_id.as_str()));
        let failed_writes = self
            .writes
            .fail_device(&device_id, || TetherError::disconnected(device_id.as_str()));

        let Some(link) = self.links.remove(&device_id) else {
            debug!(device_id = %device_id, "Disconnected event for unknown link");
            return;
        };
        for op in link.deferred {
            op.fail(TetherError::disconnected(device_id.as_str()));
        }
        for waiter in link.connect_waiters {
            let _ = waiter.send(Err(TetherError::disconnected(device_id.as_str())));
        }
        for waiter in link.disconnect_waiters {
            let _ = waiter.send(Ok(()));
        }
        info!(
            device_id = %device_id,
            failed = failed_reads + failed_writes,
            "Disconnected"
        );
        self.emit_link(&device_id, LinkState::Disconnected);
    }

    async fn on_services_discovered(&mut self, device_id: DeviceId, result: Result<Vec<Uuid>>) {
        let Some(link) = self.links.get_mut(&device_id) else {
            return;
        };
        let deferred = std::mem::take(&mut link.deferred);
        match result {
            Ok(characteristics) => {
                debug!(device_id = %device_id, count = characteristics.len(), "Services discovered");
                link.services = ServicePhase::Discovered(characteristics);
                for op in deferred {
                    self.gatt(device_id.clone(), op).await;
                }
            }
            Err(e) => {
                link.deferred = deferred;
                self.fail_discovery(&device_id, &e);
            }
        }
    }

    /// Reset the link so the next operation retries discovery
    fn fail_discovery(&mut self, device_id: &DeviceId, error: &TetherError) {
        warn!(device_id = %device_id, "Service discovery failed: {}", error);
        let Some(link) = self.links.get_mut(device_id) else {
            return;
        };
        link.services = ServicePhase::Unknown;
        for op in link.deferred.drain(..) {
            op.fail(TetherError::platform(error.to_string()));
        }
    }

    fn emit_link(&self, device_id: &DeviceId, state: LinkState) {
        self.events.emit(BleEvent::ConnectionStateChanged {
            device_id: device_id.clone(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{FollowToken, UserHash};

    #[test]
    fn sighting_decoding_prefers_manufacturer_data() {
        let frame = AdvertisementPayload::new("alice", UserHash::new([1; 6]), FollowToken::new([2; 4]));
        let other = AdvertisementPayload::new("bob", UserHash::new([3; 6]), FollowToken::new([4; 4]));
        let name = other.to_name_string();

        let bytes = frame.to_bytes();
        let decoded = decode_sighting(Some(bytes.as_slice()), Some(name.as_str()));
        assert_eq!(decoded, frame);

        let fallback = decode_sighting(Some(&[0u8, 1][..]), Some(name.as_str()));
        assert_eq!(fallback, other);

        let unknown = decode_sighting(None, Some("Some Headphones"));
        assert!(!unknown.is_known());
    }
}
