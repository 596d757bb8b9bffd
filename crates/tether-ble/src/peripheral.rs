//! Peripheral Engine: advertiser and GATT server
//!
//! ```text
//! idle -> initializing -> ready -> advertising
//! ```
//!
//! `ready` is only reached once the radio reports powered on. Advertising
//! requests made before then are queued (latest wins) and replayed exactly
//! once; permanent radio states fail them immediately.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tether_core::{
    AdvertisementPayload, BleEvent, DeviceId, EventSink, FollowToken, HandshakeMessage,
    OperationError, Profile, RadioState, Result, TetherError, UserHash,
    HANDSHAKE_CHARACTERISTIC_UUID, PROFILE_CHARACTERISTIC_UUID,
};

use crate::config::BleConfig;
use crate::radio::{InputSender, PeripheralInput, PeripheralRadio};

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Idle,
    Initializing,
    Ready,
    Advertising,
}

/// Snapshot of the engine for diagnostics
#[derive(Debug, Clone)]
pub struct PeripheralStatus {
    pub state: PeripheralState,
    pub radio_state: RadioState,
    pub advertising: Option<AdvertisementPayload>,
    pub has_profile: bool,
}

enum PeripheralCommand {
    SetProfileData {
        profile: Vec<u8>,
        respond: oneshot::Sender<Result<()>>,
    },
    StartAdvertising {
        payload: AdvertisementPayload,
        respond: oneshot::Sender<Result<()>>,
    },
    UpdateAdvertisement {
        payload: AdvertisementPayload,
        respond: oneshot::Sender<Result<()>>,
    },
    StopAdvertising {
        respond: oneshot::Sender<Result<()>>,
    },
    Status {
        respond: oneshot::Sender<Result<PeripheralStatus>>,
    },
    Shutdown,
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Cloneable handle to a running peripheral engine
#[derive(Clone)]
pub struct PeripheralHandle {
    commands: mpsc::Sender<PeripheralCommand>,
    inputs: InputSender<PeripheralInput>,
}

impl PeripheralHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> PeripheralCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| TetherError::channel_error("peripheral engine stopped"))?;
        rx.await
            .map_err(|_| TetherError::channel_error("peripheral engine dropped the request"))?
    }

    /// Serve `profile` from the Profile characteristic
    pub async fn set_profile_data(&self, profile: &Profile) -> Result<()> {
        let profile = profile.to_bytes()?;
        self.request(|respond| PeripheralCommand::SetProfileData { profile, respond })
            .await
    }

    pub async fn start_advertising(
        &self,
        display_name: &str,
        user_hash: UserHash,
        follow_token: FollowToken,
    ) -> Result<()> {
        let payload = AdvertisementPayload::new(display_name, user_hash, follow_token);
        self.request(|respond| PeripheralCommand::StartAdvertising { payload, respond })
            .await
    }

    /// Replace the advertised payload, restarting the advertisement if needed
    pub async fn update_advertisement(
        &self,
        display_name: &str,
        user_hash: UserHash,
        follow_token: FollowToken,
    ) -> Result<()> {
        let payload = AdvertisementPayload::new(display_name, user_hash, follow_token);
        self.request(|respond| PeripheralCommand::UpdateAdvertisement { payload, respond })
            .await
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.request(|respond| PeripheralCommand::StopAdvertising { respond })
            .await
    }

    pub async fn status(&self) -> Result<PeripheralStatus> {
        self.request(|respond| PeripheralCommand::Status { respond })
            .await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(PeripheralCommand::Shutdown).await;
    }

    /// Input channel into the engine, for shims and test harnesses
    pub fn input_sender(&self) -> InputSender<PeripheralInput> {
        self.inputs.clone()
    }
}

// ----------------------------------------------------------------------------
// Engine Task
// ----------------------------------------------------------------------------

struct InFlight {
    payload: AdvertisementPayload,
    respond: Option<oneshot::Sender<Result<()>>>,
    cancelled: bool,
}

struct Queued {
    payload: AdvertisementPayload,
    respond: Option<oneshot::Sender<Result<()>>>,
    /// Replace a running advertisement instead of treating it as a no-op
    replace: bool,
}

fn reply(respond: Option<oneshot::Sender<Result<()>>>, result: Result<()>, events: &EventSink) {
    match respond {
        Some(respond) => {
            let _ = respond.send(result);
        }
        None => {
            if let Err(e) = result {
                events.emit_error(&e);
            }
        }
    }
}

/// Owns the peripheral state; every change goes through `run`
pub struct PeripheralEngine<R> {
    radio: R,
    events: EventSink,
    state: PeripheralState,
    radio_state: RadioState,
    profile: Option<Vec<u8>>,
    advertising: Option<AdvertisementPayload>,
    in_flight: Option<InFlight>,
    queued: Option<Queued>,
    service_published: bool,
    default_mtu: usize,
    command_receiver: mpsc::Receiver<PeripheralCommand>,
    input_receiver: mpsc::UnboundedReceiver<PeripheralInput>,
    input_sender: InputSender<PeripheralInput>,
    running: bool,
}

impl<R: PeripheralRadio> PeripheralEngine<R> {
    /// Spawn the engine on the current runtime
    pub fn spawn(radio: R, events: EventSink, config: &BleConfig) -> PeripheralHandle {
        let (command_sender, command_receiver) = mpsc::channel(config.command_buffer.max(1));
        let (input_sender, input_receiver) = mpsc::unbounded_channel();

        let engine = Self {
            radio,
            events,
            state: PeripheralState::Idle,
            radio_state: RadioState::Unknown,
            profile: None,
            advertising: None,
            in_flight: None,
            queued: None,
            service_published: false,
            default_mtu: config.default_mtu.max(1),
            command_receiver,
            input_receiver,
            input_sender: input_sender.clone(),
            running: true,
        };
        tokio::spawn(engine.run());

        PeripheralHandle {
            commands: command_sender,
            inputs: input_sender,
        }
    }

    async fn run(mut self) {
        self.state = PeripheralState::Initializing;
        if let Err(e) = self.radio.power_on(self.input_sender.clone()).await {
            error!("Peripheral radio failed to start: {}", e);
            self.events.emit_error(&e);
            if let TetherError::Radio(radio) = &e {
                self.radio_state = RadioState::from(radio);
            }
            self.state = PeripheralState::Idle;
        }

        while self.running {
            tokio::select! {
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Peripheral command channel closed, shutting down");
                        break;
                    }
                },
                Some(input) = self.input_receiver.recv() => self.handle_input(input).await,
            }
        }

        if self.advertising.is_some() {
            if let Err(e) = self.radio.stop_advertising().await {
                warn!("Failed to stop advertising on shutdown: {}", e);
            }
        }
        info!("Peripheral engine stopped");
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: PeripheralCommand) {
        match command {
            PeripheralCommand::SetProfileData { profile, respond } => {
                debug!(bytes = profile.len(), "Profile data set");
                self.profile = Some(profile);
                let _ = respond.send(Ok(()));
            }
            PeripheralCommand::StartAdvertising { payload, respond } => {
                self.start(payload, respond, false).await;
            }
            PeripheralCommand::UpdateAdvertisement { payload, respond } => {
                self.start(payload, respond, true).await;
            }
            PeripheralCommand::StopAdvertising { respond } => {
                self.stop().await;
                let _ = respond.send(Ok(()));
            }
            PeripheralCommand::Status { respond } => {
                let _ = respond.send(Ok(PeripheralStatus {
                    state: self.state,
                    radio_state: self.radio_state,
                    advertising: self.advertising.clone(),
                    has_profile: self.profile.is_some(),
                }));
            }
            PeripheralCommand::Shutdown => {
                self.running = false;
            }
        }
    }

    async fn start(
        &mut self,
        payload: AdvertisementPayload,
        respond: oneshot::Sender<Result<()>>,
        replace: bool,
    ) {
        if let Some(err) = self.radio_state.to_error() {
            let _ = respond.send(Err(err.into()));
            return;
        }
        if self.in_flight.is_some() || !self.radio_state.is_ready() {
            self.enqueue(Queued {
                payload,
                respond: Some(respond),
                replace,
            });
            return;
        }
        self.apply(payload, Some(respond), replace).await;
    }

    /// Run a request against a ready radio with nothing in flight
    async fn apply(
        &mut self,
        payload: AdvertisementPayload,
        respond: Option<oneshot::Sender<Result<()>>>,
        replace: bool,
    ) {
        if let Some(current) = &self.advertising {
            if !replace || current == &payload {
                reply(respond, Ok(()), &self.events);
                return;
            }
            if let Err(e) = self.radio.stop_advertising().await {
                warn!("Failed to stop advertisement before update: {}", e);
            }
            self.advertising = None;
            self.state = PeripheralState::Ready;
        }
        self.submit(payload, respond).await;
    }

    fn enqueue(&mut self, queued: Queued) {
        debug!(radio_state = ?self.radio_state, "Advertising request queued");
        if let Some(previous) = self.queued.replace(queued) {
            reply(
                previous.respond,
                Err(OperationError::Superseded.into()),
                &self.events,
            );
        }
    }

    async fn submit(
        &mut self,
        payload: AdvertisementPayload,
        respond: Option<oneshot::Sender<Result<()>>>,
    ) {
        match self.radio.start_advertising(payload.clone()).await {
            Ok(()) => {
                self.in_flight = Some(InFlight {
                    payload,
                    respond,
                    cancelled: false,
                });
            }
            Err(e) => {
                error!("Failed to submit advertisement: {}", e);
                reply(respond, Err(e), &self.events);
            }
        }
    }

    async fn drain_queue(&mut self) {
        if self.in_flight.is_some() || !self.radio_state.is_ready() {
            return;
        }
        if let Some(queued) = self.queued.take() {
            debug!("Replaying queued advertising request");
            self.apply(queued.payload, queued.respond, queued.replace)
                .await;
        }
    }

    async fn stop(&mut self) {
        if let Some(queued) = self.queued.take() {
            reply(
                queued.respond,
                Err(OperationError::Superseded.into()),
                &self.events,
            );
        }
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.cancelled = true;
        }
        if self.advertising.take().is_some() {
            if let Err(e) = self.radio.stop_advertising().await {
                warn!("Failed to stop advertising: {}", e);
            }
            self.state = PeripheralState::Ready;
            info!("Stopped advertising");
        }
    }

    // ------------------------------------------------------------------------
    // Radio Inputs
    // ------------------------------------------------------------------------

    async fn handle_input(&mut self, input: PeripheralInput) {
        match input {
            PeripheralInput::StateChanged(state) => self.on_state_changed(state).await,
            PeripheralInput::AdvertisingStarted(result) => self.on_advertising_started(result).await,
            PeripheralInput::ReadRequest {
                device_id,
                characteristic,
                offset,
                mtu,
                respond,
            } => {
                let _ = respond.send(self.read(&device_id, characteristic, offset, mtu));
            }
            PeripheralInput::WriteRequest {
                device_id,
                characteristic,
                value,
                respond,
            } => {
                let _ = respond.send(self.write(device_id, characteristic, &value));
            }
        }
    }

    async fn on_state_changed(&mut self, state: RadioState) {
        debug!(from = ?self.radio_state, to = ?state, "Peripheral radio state changed");
        self.radio_state = state;

        if state.is_ready() {
            if matches!(self.state, PeripheralState::Idle | PeripheralState::Initializing) {
                self.state = PeripheralState::Ready;
            }
            if !self.service_published {
                match self.radio.publish_service().await {
                    Ok(()) => {
                        self.service_published = true;
                        info!("Tether GATT service published");
                    }
                    Err(e) => {
                        error!("Failed to publish GATT service: {}", e);
                        self.events.emit_error(&e);
                    }
                }
            }
            self.drain_queue().await;
        } else if let Some(radio_error) = state.to_error() {
            let err = TetherError::from(radio_error.clone());
            let was_advertising = self.advertising.take().is_some();
            self.state = PeripheralState::Idle;
            self.service_published = false;

            if let Some(in_flight) = self.in_flight.take() {
                reply(in_flight.respond, Err(radio_error.clone().into()), &self.events);
            }
            if let Some(queued) = self.queued.take() {
                reply(queued.respond, Err(radio_error.clone().into()), &self.events);
            }
            if was_advertising {
                error!("Advertising stopped: {}", err);
                self.events.emit_error(&err);
            }
        } else {
            // Transient: whatever was on air or awaiting confirmation resumes on power-on
            let current = self.advertising.take();
            let interrupted = current.is_some() || self.in_flight.is_some();
            if let Some(in_flight) = self.in_flight.take() {
                if in_flight.cancelled || self.queued.is_some() {
                    reply(
                        in_flight.respond,
                        Err(OperationError::Superseded.into()),
                        &self.events,
                    );
                } else {
                    self.queued = Some(Queued {
                        payload: in_flight.payload,
                        respond: in_flight.respond,
                        replace: false,
                    });
                }
            }
            if let Some(current) = current {
                if self.queued.is_none() {
                    self.queued = Some(Queued {
                        payload: current,
                        respond: None,
                        replace: false,
                    });
                }
            }
            if interrupted {
                warn!("Radio resetting; advertisement will resume when powered on");
            }
            if matches!(
                self.state,
                PeripheralState::Ready | PeripheralState::Advertising
            ) {
                self.state = PeripheralState::Initializing;
            }
        }
    }

    async fn on_advertising_started(&mut self, result: Result<()>) {
        let Some(in_flight) = self.in_flight.take() else {
            debug!("Advertising confirmation with nothing in flight");
            return;
        };

        match result {
            Ok(()) if in_flight.cancelled => {
                if let Err(e) = self.radio.stop_advertising().await {
                    warn!("Failed to stop cancelled advertisement: {}", e);
                }
                reply(
                    in_flight.respond,
                    Err(OperationError::Superseded.into()),
                    &self.events,
                );
            }
            Ok(()) => {
                info!(
                    user_hash = %in_flight.payload.user_hash,
                    follow_token = %in_flight.payload.follow_token,
                    "Advertising started"
                );
                self.advertising = Some(in_flight.payload);
                self.state = PeripheralState::Advertising;
                reply(in_flight.respond, Ok(()), &self.events);
            }
            Err(e) => {
                error!("Platform rejected advertisement: {}", e);
                reply(in_flight.respond, Err(e), &self.events);
            }
        }
        self.drain_queue().await;
    }

    // ------------------------------------------------------------------------
    // GATT Server
    // ------------------------------------------------------------------------

    fn read(
        &self,
        device_id: &DeviceId,
        characteristic: Uuid,
        offset: usize,
        mtu: Option<usize>,
    ) -> Result<Vec<u8>> {
        if characteristic != PROFILE_CHARACTERISTIC_UUID {
            return Err(OperationError::CharacteristicNotFound {
                device_id: device_id.to_string(),
                characteristic: characteristic.to_string(),
            }
            .into());
        }
        let profile = self.profile.as_ref().ok_or(OperationError::NoData)?;
        if offset > profile.len() {
            return Err(OperationError::InvalidOffset {
                offset,
                length: profile.len(),
            }
            .into());
        }
        let mtu = mtu.unwrap_or(self.default_mtu).max(1);
        let end = profile.len().min(offset + mtu);
        debug!(device_id = %device_id, offset, served = end - offset, "Profile read");
        Ok(profile[offset..end].to_vec())
    }

    fn write(&self, device_id: DeviceId, characteristic: Uuid, value: &[u8]) -> Result<()> {
        if characteristic != HANDSHAKE_CHARACTERISTIC_UUID {
            return Err(OperationError::CharacteristicNotFound {
                device_id: device_id.to_string(),
                characteristic: characteristic.to_string(),
            }
            .into());
        }
        match HandshakeMessage::from_bytes(value) {
            Ok(message) => {
                info!(
                    device_id = %device_id,
                    sender = %message.sender_id(),
                    "Handshake message received"
                );
                self.events.emit(BleEvent::FollowRequestReceived {
                    from_device_id: device_id,
                    payload: message,
                });
                Ok(())
            }
            Err(e) => {
                let err = TetherError::invalid_payload(e.to_string());
                warn!(device_id = %device_id, "Rejected handshake write: {}", e);
                self.events.emit_error(&err);
                Err(err)
            }
        }
    }
}
