use std::cmp::max;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use derivative::Derivative;
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use tokio::time::{sleep, timeout, Instant};

use crate::config::ControlConfig;
use crate::error::Result;
use crate::util::listen_port::ListenSocket;
use crate::util::packet::{parse_discovery_response, DISCOVERY_BUFFER_SIZE, DISCOVERY_QUERY};
use crate::util::serial::SerialNumber;

/**
A device found by a discovery broadcast.

Two identities are equal when their serials are equal. The IP address is
handed out by DHCP and may change between discoveries, and the name is
derived from the serial anyway.
*/
#[derive(Derivative)]
#[derivative(Hash, PartialEq, Eq)]
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub ip_address: IpAddr,

    /// Serial bytes, big-endian, as advertised in the device name.
    #[serde(serialize_with = "serialize_hex")]
    pub serial_raw: Vec<u8>,

    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub display_name: String,
}

impl DeviceIdentity {
    pub fn new(ip_address: IpAddr, serial_raw: Vec<u8>, display_name: String) -> Self {
        DeviceIdentity {
            ip_address,
            serial_raw,
            display_name,
        }
    }

    /// The serial in packet byte order.
    pub fn serial_number(&self) -> Result<SerialNumber> {
        SerialNumber::from_raw(&self.serial_raw)
    }

    pub fn serial_hex(&self) -> String {
        hex::encode_upper(&self.serial_raw)
    }
}

fn serialize_hex<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&hex::encode_upper(bytes))
}

/**
Broadcast discovery of a single device.

The client binds the fixed listen port, since the device answers there and not
to the sender's port. Binding waits while a discovery or liveness check in this
process holds the port.

The port is released by [`Discovery::close`] or when the value is dropped.
*/
pub struct Discovery {
    listener: ListenSocket,
    target: SocketAddr,
    rebroadcast_delay: Duration,
}

impl Discovery {
    pub async fn bind(config: &ControlConfig) -> Result<Self> {
        let listener = ListenSocket::bind(config.listen_port).await?;
        debug!("Discovery socket bound to {}", listener.local_addr()?);

        Ok(Discovery {
            listener,
            target: SocketAddr::new(IpAddr::V4(config.broadcast_address), config.device_port),
            rebroadcast_delay: config.rebroadcast_delay,
        })
    }

    /**
    Broadcasts the query and waits up to `given_timeout` for the first reply
    that parses.

    Replies that do not parse are skipped. A timeout or socket error returns
    `None`, an absent device is not a fault.
    */
    pub async fn discover(&self, given_timeout: Duration) -> Option<DeviceIdentity> {
        let timeout_end = Instant::now() + given_timeout;

        if let Err(e) = self.broadcast_query().await {
            warn!("Failed to send discovery query to {}: {}", self.target, e);
            return None;
        }

        let mut buffer = [0u8; DISCOVERY_BUFFER_SIZE];
        loop {
            let remaining_time = timeout_end.saturating_duration_since(Instant::now());
            if remaining_time.is_zero() {
                break;
            }

            match timeout(remaining_time, self.listener.socket().recv_from(&mut buffer)).await {
                Ok(Ok((number_of_bytes, src_addr))) => {
                    let received_data = &buffer[..number_of_bytes];
                    debug!(
                        "Discovery reply from {}: {}",
                        src_addr,
                        hex::encode_upper(received_data)
                    );
                    match parse_discovery_response(received_data, src_addr.ip()) {
                        Some(identity) => {
                            info!(
                                "Found device {} at {} (serial {})",
                                identity.display_name,
                                identity.ip_address,
                                identity.serial_hex()
                            );
                            return Some(identity);
                        }
                        None => debug!("Ignoring non-matching datagram from {}", src_addr),
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to receive discovery response: {}", e);
                    return None;
                }
                Err(_) => break,
            }
        }

        info!("Discovery time complete, no device answered");
        None
    }

    /// Sends the query twice, a single broadcast is easily lost.
    async fn broadcast_query(&self) -> std::io::Result<()> {
        let socket = self.listener.socket();
        socket.send_to(&DISCOVERY_QUERY, self.target).await?;
        sleep(self.rebroadcast_delay).await;
        socket.send_to(&DISCOVERY_QUERY, self.target).await?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn close(self) {
        debug!("Closing discovery socket");
        drop(self.listener);
    }

    /// Binds, discovers and closes in one go.
    pub async fn find_device(config: &ControlConfig) -> Option<DeviceIdentity> {
        let discovery = match Discovery::bind(config).await {
            Ok(discovery) => discovery,
            Err(e) => {
                warn!(
                    "Cannot bind discovery socket on port {}: {}",
                    config.listen_port, e
                );
                return None;
            }
        };
        let device = discovery.discover(config.discovery_timeout).await;
        discovery.close();
        device
    }

    pub fn pretty_print_device(device: &DeviceIdentity) {
        let ip = device.ip_address.to_string();
        let serial = device.serial_hex();
        let ip_width = max(ip.len(), "IP Address".len()) + 2;
        let serial_width = max(serial.len(), "Serial".len()) + 2;
        let name_width = max(device.display_name.len(), "Device Name".len());

        println!(
            "{:<ip_width$} {:<serial_width$} {:<name_width$}",
            "IP Address", "Serial", "Device Name",
        );
        println!(
            "{:<ip_width$} {:<serial_width$} {:<name_width$}",
            "-".repeat(ip_width - 2),
            "-".repeat(serial_width - 2),
            "-".repeat(name_width),
        );
        println!(
            "{:<ip_width$} {:<serial_width$} {:<name_width$}",
            ip, serial, device.display_name,
        );
    }
}
