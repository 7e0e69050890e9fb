use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::util::listen_port::ListenSocket;
use crate::util::packet::{
    build_control_packet, build_liveness_probe, is_liveness_response, CONTROL_TEMPLATE,
    PROBE_BUFFER_SIZE,
};
use crate::util::serial::SerialNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Open,
    Closed,
}

/**
A UDP conversation with one device.

Commands leave from a socket on an ephemeral port, opened on the first command
or liveness check and kept until [`DeviceSession::close`]. The device answers
liveness checks on the fixed listen port, which is only held for the duration of
[`DeviceSession::check_availability`], so several sessions and a discovery can
coexist in one process. A closed session stays closed; build a new one to talk
to the device again.

All operations take `&mut self`, which keeps the command counter single-writer.
Share a session between tasks behind a mutex.
*/
#[derive(Debug)]
pub struct DeviceSession {
    host: String,
    port: u16,
    listen_port: u16,
    probe_slice: Duration,
    socket: Option<UdpSocket>,
    closed: bool,
    /// Counter of the last command that left the host.
    counter: u8,
    serial: SerialNumber,
}

impl DeviceSession {
    pub fn new(host: &str, config: &ControlConfig) -> Self {
        DeviceSession {
            host: host.to_string(),
            port: config.device_port,
            listen_port: config.listen_port,
            probe_slice: config.probe_slice,
            socket: None,
            closed: false,
            counter: 0,
            serial: SerialNumber::default(),
        }
    }

    pub fn with_serial(mut self, serial: SerialNumber) -> Self {
        self.serial = serial;
        self
    }

    pub fn set_serial_number(&mut self, serial: SerialNumber) {
        info!("Serial number set: {}", serial);
        self.serial = serial;
    }

    /// Sets the serial from its hex form, e.g. `0C3951`.
    pub fn set_serial_hex(&mut self, serial: &str) -> Result<()> {
        let serial = SerialNumber::from_hex(serial).map_err(|e| {
            error!("Invalid serial number {:?}: {}", serial, e);
            e
        })?;
        self.set_serial_number(serial);
        Ok(())
    }

    pub fn serial_number(&self) -> SerialNumber {
        self.serial
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.socket.is_some() {
            SessionState::Open
        } else {
            SessionState::Unopened
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Opens the command socket unless it is already open.
    pub fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        if self.closed {
            return Err(ControlError::Socket(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session is closed",
            )));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&local.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        debug!(
            "UDP socket for {}:{} bound to {}",
            self.host,
            self.port,
            socket.local_addr()?
        );
        self.socket = Some(socket);
        Ok(())
    }

    /**
    Sends one control packet with the next counter value.

    The counter only advances when the packet was handed to the network, a
    failed send can be retried with the same counter. Returns `false` on
    failure; the cause is logged.
    */
    pub async fn send_command(&mut self, brightness: i32, speed: i32, is_on: bool) -> bool {
        if let Err(e) = self.open() {
            error!("Cannot open socket for {}: {}", self.host, e);
            return false;
        }
        let Some(socket) = self.socket.as_ref() else {
            return false;
        };

        let counter = self.counter.wrapping_add(1);
        let packet =
            build_control_packet(&CONTROL_TEMPLATE, counter, speed, brightness, is_on, &self.serial);

        let sent = socket
            .send_to(&packet, (self.host.as_str(), self.port))
            .await;
        match sent {
            Ok(_) => {
                self.counter = counter;
                debug!(
                    "Sent to {}:{} - {}",
                    self.host,
                    self.port,
                    hex::encode_upper(packet)
                );
                true
            }
            Err(e) => {
                error!("Error sending UDP packet to {}:{}: {}", self.host, self.port, e);
                false
            }
        }
    }

    /**
    Probes the device and waits up to `given_timeout` for its answer.

    The listen port is claimed for the check and released before returning;
    concurrent checks in this process wait for each other. The wait is split
    into short receive attempts so that unrelated datagrams and slow replies do
    not end it early. The command socket stays open afterwards whatever the
    outcome. Socket errors, including a listen port held by another process,
    end the check with `false`.
    */
    pub async fn check_availability(&mut self, given_timeout: Duration) -> bool {
        if let Err(e) = self.open() {
            warn!("Availability check failed for {}: {}", self.host, e);
            return false;
        }

        let listener = match ListenSocket::bind(self.listen_port).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(
                    "Cannot bind listen port {} to check {}: {}",
                    self.listen_port, self.host, e
                );
                return false;
            }
        };
        let socket = listener.socket();

        let probe = build_liveness_probe(&self.serial);
        debug!(
            "Sending alive check: {} to {}:{}",
            hex::encode_upper(probe),
            self.host,
            self.port
        );
        if let Err(e) = socket.send_to(&probe, (self.host.as_str(), self.port)).await {
            warn!("Cannot send alive check to {}: {}", self.host, e);
            return false;
        }

        let timeout_end = Instant::now() + given_timeout;
        let mut buffer = [0u8; PROBE_BUFFER_SIZE];
        loop {
            let remaining_time = timeout_end.saturating_duration_since(Instant::now());
            if remaining_time.is_zero() {
                break;
            }

            match timeout(remaining_time.min(self.probe_slice), socket.recv_from(&mut buffer)).await
            {
                Ok(Ok((len, from))) => {
                    debug!("Received from {}: {}", from, hex::encode_upper(&buffer[..len]));
                    if is_liveness_response(&buffer[..len], from.ip(), &self.host) {
                        return true;
                    }
                }
                Ok(Err(e)) => {
                    warn!("Socket error while waiting for {}: {}", self.host, e);
                    break;
                }
                Err(_) => continue,
            }
        }

        debug!("Device {} not responding", self.host);
        false
    }

    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Closed UDP socket for {}", self.host);
        }
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::discovery::Discovery;
    use crate::util::listen_port::free_port;

    fn test_serial() -> SerialNumber {
        SerialNumber::from_hex("0C3951").unwrap()
    }

    fn device_config(device: &UdpSocket, listen_port: u16) -> ControlConfig {
        ControlConfig {
            device_port: device.local_addr().unwrap().port(),
            listen_port,
            probe_slice: Duration::from_millis(50),
            ..ControlConfig::default()
        }
    }

    /// A fake device on loopback and a session pointed at it.
    async fn session_with_device() -> (DeviceSession, UdpSocket) {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = device_config(&device, 0);
        let session = DeviceSession::new("127.0.0.1", &config).with_serial(test_serial());
        (session, device)
    }

    /// Answers the next liveness check and hands the device back.
    fn answer_next(device: UdpSocket) -> tokio::task::JoinHandle<(UdpSocket, SocketAddr)> {
        tokio::spawn(async move {
            let (_, from) = recv_packet(&device).await;
            device.send_to(&[0xFB, 0xC0], from).await.unwrap();
            (device, from)
        })
    }

    async fn recv_packet(device: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .expect("no packet received")
            .unwrap();
        (buf[..len].to_vec(), from)
    }

    #[tokio::test]
    async fn test_socket_opens_lazily() {
        let (mut session, _device) = session_with_device().await;
        assert_eq!(session.state(), SessionState::Unopened);
        assert!(session.local_addr().is_none());

        session.open().unwrap();
        let addr = session.local_addr().unwrap();
        session.open().unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.local_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_send_command_packet() {
        let (mut session, device) = session_with_device().await;

        assert!(session.send_command(31, 80, true).await);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.counter(), 1);

        let (packet, _) = recv_packet(&device).await;
        assert_eq!(
            packet,
            vec![
                0xFB, 0xC1, 0x01, 0x50, 0x1F, 0x01, 0x00, 0xAE, 0x00, 0x00, 0x00, 0x00, 0x51,
                0x39, 0x0C, 0x00
            ]
        );
    }

    #[tokio::test]
    async fn test_counter_wraps_after_255_sends() {
        let (mut session, device) = session_with_device().await;

        for expected in 1..=255u8 {
            assert!(session.send_command(10, 50, true).await);
            let (packet, _) = recv_packet(&device).await;
            assert_eq!(packet[2], expected);
        }
        assert_eq!(session.counter(), 255);

        assert!(session.send_command(10, 50, true).await);
        let (packet, _) = recv_packet(&device).await;
        assert_eq!(packet[2], 0);
        assert_eq!(session.counter(), 0);
    }

    #[tokio::test]
    async fn test_send_on_closed_session_fails() {
        let (mut session, _device) = session_with_device().await;
        assert!(session.send_command(10, 50, true).await);
        session.close();

        assert!(!session.send_command(10, 50, true).await);
        assert_eq!(session.counter(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, _device) = session_with_device().await;
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.open().is_err());
    }

    #[tokio::test]
    async fn test_set_serial_hex() {
        let (mut session, _device) = session_with_device().await;
        session.set_serial_hex("AABBCCDD").unwrap();
        assert_eq!(session.serial_number().wire_bytes(), [0xDD, 0xCC, 0xBB, 0xAA]);

        assert!(session.set_serial_hex("ZZ").is_err());
        assert_eq!(session.serial_number().wire_bytes(), [0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[tokio::test]
    async fn test_availability_with_reply() {
        let (mut session, device) = session_with_device().await;

        let responder = tokio::spawn(async move {
            let (probe, from) = recv_packet(&device).await;
            device.send_to(&[0xFB, 0xC0, 0x00], from).await.unwrap();
            probe
        });

        assert!(session.check_availability(Duration::from_secs(2)).await);
        let probe = responder.await.unwrap();
        assert_eq!(
            probe,
            vec![0xFB, 0xC1, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x51, 0x39, 0x0C, 0x00]
        );
    }

    #[tokio::test]
    async fn test_availability_ignores_wrong_header() {
        let (mut session, device) = session_with_device().await;

        let responder = tokio::spawn(async move {
            let (_, from) = recv_packet(&device).await;
            device.send_to(&[0xFB, 0xC1], from).await.unwrap();
            device.send_to(&[0xAB, 0x02], from).await.unwrap();
        });

        assert!(!session.check_availability(Duration::from_millis(300)).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_availability_waits_across_slices() {
        let (mut session, device) = session_with_device().await;

        let responder = tokio::spawn(async move {
            let (_, from) = recv_packet(&device).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            device.send_to(&[0xFB, 0xC0], from).await.unwrap();
        });

        assert!(session.check_availability(Duration::from_secs(2)).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_probe_keeps_socket_reusable() {
        let (mut session, device) = session_with_device().await;

        let started = Instant::now();
        assert!(!session.check_availability(Duration::from_millis(200)).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(session.state(), SessionState::Open);
        let addr = session.local_addr().unwrap();

        // Drain the unanswered probe, then answer the next one.
        let _ = recv_packet(&device).await;
        let responder = tokio::spawn(async move {
            let (_, from) = recv_packet(&device).await;
            device.send_to(&[0xFB, 0xC0], from).await.unwrap();
        });

        assert!(session.check_availability(Duration::from_secs(2)).await);
        assert_eq!(session.local_addr().unwrap(), addr);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_availability_on_closed_session() {
        let (mut session, _device) = session_with_device().await;
        session.close();
        assert!(!session.check_availability(Duration::from_millis(100)).await);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_sessions_share_fixed_listen_port() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_port = free_port();
        let config = device_config(&device, listen_port);
        let mut first = DeviceSession::new("127.0.0.1", &config).with_serial(test_serial());
        let mut second = DeviceSession::new("127.0.0.1", &config).with_serial(test_serial());

        first.open().unwrap();
        second.open().unwrap();
        assert_ne!(first.local_addr().unwrap().port(), listen_port);
        assert_ne!(second.local_addr().unwrap().port(), listen_port);

        assert!(second.send_command(10, 50, true).await);
        let (_, command_from) = recv_packet(&device).await;
        assert_eq!(command_from.port(), second.local_addr().unwrap().port());

        let responder = answer_next(device);
        assert!(first.check_availability(Duration::from_secs(2)).await);
        let (device, check_from) = responder.await.unwrap();
        assert_eq!(check_from.port(), listen_port);

        let responder = answer_next(device);
        assert!(second.check_availability(Duration::from_secs(2)).await);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_binds_while_session_open() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen_port = free_port();
        let config = device_config(&device, listen_port);
        let mut session = DeviceSession::new("127.0.0.1", &config).with_serial(test_serial());

        session.open().unwrap();
        let discovery = Discovery::bind(&config).await.unwrap();
        assert_eq!(discovery.local_addr().unwrap().port(), listen_port);
        discovery.close();

        let responder = answer_next(device);
        assert!(session.check_availability(Duration::from_secs(2)).await);
        responder.await.unwrap();
        assert_eq!(session.state(), SessionState::Open);

        let discovery = Discovery::bind(&config).await.unwrap();
        assert_eq!(discovery.local_addr().unwrap().port(), listen_port);
        discovery.close();
    }

    #[tokio::test]
    async fn test_availability_fails_when_listen_port_taken() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let foreign = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let config = device_config(&device, foreign.local_addr().unwrap().port());
        let mut session = DeviceSession::new("127.0.0.1", &config).with_serial(test_serial());

        assert!(!session.check_availability(Duration::from_secs(2)).await);
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.send_command(10, 50, true).await);
    }
}
