use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::util::discovery::{DeviceIdentity, Discovery};
use crate::util::packet::{BRIGHTNESS_MAX, SPEED_MAX, SPEED_MIN};
use crate::util::serial::SerialNumber;

pub mod session;

pub use session::{DeviceSession, SessionState};

/// The last state commanded through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightState {
    pub is_on: bool,
    /// Range is 0..=255.
    pub brightness: u8,
    /// Effect speed, range is 1..=100.
    pub speed: u8,
}

#[derive(Debug)]
struct Device {
    session: DeviceSession,
    light: LightState,
}

/**
High level control of a single H806SB device.

The facade owns the device session and remembers whether the device answered
its last liveness check. Commands are refused while the device is believed to
be unreachable; [`ControlInterface::refresh_availability`] or the background
poll from [`ControlInterface::spawn_availability_poll`] update that belief.
*/
#[derive(Debug)]
pub struct ControlInterface {
    pub host: String,
    identity: Option<DeviceIdentity>,
    device: Mutex<Device>,
    available: AtomicBool,
    config: ControlConfig,
}

impl ControlInterface {
    /**
    Creates an interface for a manually entered device.

    No packet is sent. The device counts as unavailable until the first
    successful availability check.
    */
    pub fn new(host: &str, serial_hex: &str, config: ControlConfig) -> Result<Self> {
        let serial = SerialNumber::from_hex(serial_hex)?;
        let session = DeviceSession::new(host, &config).with_serial(serial);
        Ok(Self::with_session(session, None, config, false))
    }

    /**
    Creates a [ControlInterface] by a [DeviceIdentity], without checking that
    the device is reachable.
    */
    pub fn from_device_identifier(identity: DeviceIdentity, config: ControlConfig) -> Result<Self> {
        let serial = identity.serial_number()?;
        let session =
            DeviceSession::new(&identity.ip_address.to_string(), &config).with_serial(serial);
        Ok(Self::with_session(session, Some(identity), config, false))
    }

    fn with_session(
        session: DeviceSession,
        identity: Option<DeviceIdentity>,
        config: ControlConfig,
        available: bool,
    ) -> Self {
        let light = LightState {
            is_on: false,
            brightness: u8::MAX,
            speed: clamp_speed(config.default_speed),
        };
        ControlInterface {
            host: session.host().to_string(),
            identity,
            device: Mutex::new(Device { session, light }),
            available: AtomicBool::new(available),
            config,
        }
    }

    /// Looks for a device on the local network.
    pub async fn discover(config: &ControlConfig) -> Option<DeviceIdentity> {
        Discovery::find_device(config).await
    }

    /// Discovers a device and keeps it only if it answers a liveness probe.
    pub async fn verify_then_create(config: ControlConfig) -> Result<Self> {
        let found = Self::discover(&config).await;
        Self::create_verified(found, config).await
    }

    /**
    Second half of [`ControlInterface::verify_then_create`], for a discovery
    result obtained elsewhere.

    Fails with [`ControlError::DeviceNotFound`] on `None` before any socket is
    opened, and with [`ControlError::DeviceUnavailable`] if the device does not
    answer, in which case the session is closed again.
    */
    pub async fn create_verified(
        found: Option<DeviceIdentity>,
        config: ControlConfig,
    ) -> Result<Self> {
        let identity = found.ok_or(ControlError::DeviceNotFound)?;
        let serial = identity.serial_number()?;
        let host = identity.ip_address.to_string();

        let mut session = DeviceSession::new(&host, &config).with_serial(serial);
        if !session.check_availability(config.probe_timeout).await {
            session.close();
            return Err(ControlError::DeviceUnavailable(host));
        }
        info!("Device {} verified at {}", identity.display_name, host);

        Ok(Self::with_session(session, Some(identity), config, true))
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Reachability as of the last liveness check.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn light_state(&self) -> LightState {
        self.device.lock().await.light
    }

    pub async fn session_state(&self) -> SessionState {
        self.device.lock().await.session.state()
    }

    /// Probes the device once and records the outcome.
    pub async fn refresh_availability(&self) -> bool {
        let available = self
            .device
            .lock()
            .await
            .session
            .check_availability(self.config.probe_timeout)
            .await;
        let was_available = self.available.swap(available, Ordering::SeqCst);
        if was_available != available {
            info!(
                "Device {} is now {}",
                self.host,
                if available { "available" } else { "unavailable" }
            );
        }
        available
    }

    /**
    Probes the device every `poll_interval` until the returned task is aborted
    or the facade is dropped.
    */
    pub fn spawn_availability_poll(self: &Arc<Self>) -> JoinHandle<()> {
        let control = Arc::downgrade(self);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(control) = control.upgrade() else {
                    debug!("Control interface dropped, stopping availability poll");
                    break;
                };
                control.refresh_availability().await;
            }
        })
    }

    /**
    Turns the device on.

    # Arguments
    - `brightness`: Range is 0..=255, scaled to the device's 0..=31.
                    `None` keeps the last brightness.
    */
    pub async fn turn_on(&self, brightness: Option<u8>) -> Result<()> {
        let mut device = self.device.lock().await;
        let light = LightState {
            is_on: true,
            brightness: brightness.unwrap_or(device.light.brightness),
            speed: device.light.speed,
        };
        self.send_light(&mut device, light).await
    }

    /// Turns the device off. The last brightness and speed are remembered.
    pub async fn turn_off(&self) -> Result<()> {
        let mut device = self.device.lock().await;
        let light = LightState {
            is_on: false,
            ..device.light
        };
        self.send_light(&mut device, light).await
    }

    /// Sets the brightness, range is 0..=255, and switches the device on.
    pub async fn set_brightness(&self, brightness: u8) -> Result<()> {
        self.turn_on(Some(brightness)).await
    }

    /// Sets the effect speed, clamped to 1..=100, keeping the power state.
    pub async fn set_speed(&self, speed: u8) -> Result<()> {
        let mut device = self.device.lock().await;
        let light = LightState {
            speed: clamp_speed(speed),
            ..device.light
        };
        self.send_light(&mut device, light).await
    }

    async fn send_light(&self, device: &mut Device, light: LightState) -> Result<()> {
        if !self.is_available() {
            warn!("Refusing command, device {} is unavailable", self.host);
            return Err(ControlError::DeviceUnavailable(self.host.clone()));
        }

        let sent = if light.is_on {
            device
                .session
                .send_command(
                    scale_brightness(light.brightness),
                    i32::from(light.speed),
                    true,
                )
                .await
        } else {
            device.session.send_command(0, 0, false).await
        };
        if !sent {
            return Err(ControlError::CommandTransmissionFailed(self.host.clone()));
        }

        device.light = light;
        Ok(())
    }

    pub async fn close(&self) {
        self.device.lock().await.session.close();
    }
}

/// Maps a 0..=255 brightness onto the device's 0..=31 range.
pub fn scale_brightness(brightness: u8) -> i32 {
    (f64::from(brightness) / 255.0 * f64::from(BRIGHTNESS_MAX)).round() as i32
}

fn clamp_speed(speed: u8) -> u8 {
    i32::from(speed).clamp(SPEED_MIN, SPEED_MAX) as u8
}
