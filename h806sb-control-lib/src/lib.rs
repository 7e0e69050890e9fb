//! # H806SB Control Library
//!
//! `h806sb-control-lib` is a Rust library for controlling H806SB LED strip drivers
//! over their UDP protocol. It finds a driver on the local network, checks that it
//! is alive, and switches it on and off, sets its brightness and its effect speed.
//!
//! ## Features
//!
//! - Broadcast discovery of a driver on the local network segment
//! - Liveness probing of a known driver
//! - Power, brightness and speed commands
//! - Pure packet builders and parsers for the wire protocol
//!
//! ## Example
//!
//! Discover a driver, verify it answers, and turn it on at full brightness:
//!
//! ```no_run
//! use h806sb_control_lib::config::ControlConfig;
//! use h806sb_control_lib::control_interface::ControlInterface;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let control = ControlInterface::verify_then_create(ControlConfig::default()).await?;
//!     control.turn_on(Some(255)).await?;
//!     control.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol
//!
//! The driver listens on UDP port 4626 and answers on port 4882, which therefore
//! has to be free on the controlling host. There is no authentication. Discovery
//! relies on broadcast and does not cross routers.

pub mod config;

// The `control_interface` module provides the high level operations on a single
// device and the UDP session they run on.
//
// Example usage:
//
// ```
// use h806sb_control_lib::config::ControlConfig;
// use h806sb_control_lib::control_interface::ControlInterface;
//
// #[tokio::main]
// async fn main() {
//     let control = ControlInterface::new("192.168.1.100", "0C3951", ControlConfig::default()).unwrap();
//     if control.refresh_availability().await {
//         control.turn_off().await.unwrap();
//     }
// }
// ```
pub mod control_interface;

pub mod error;

// The `util` module holds the protocol building blocks: packet layouts, the
// serial number encoding and broadcast discovery.
pub mod util;

pub use error::{ControlError, Result};
