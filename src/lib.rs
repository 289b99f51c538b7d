//! # juicepass-bridge
//!
//! A man-in-the-middle bridge between a network-connected residential EV
//! charger and its vendor cloud. The bridge decodes the device's proprietary
//! ASCII telemetry protocol, republishes measurements and state to a
//! home-automation message bus, accepts control inputs back from that bus,
//! and — in stand-alone mode — synthesizes the command datagrams the cloud
//! would otherwise send.
//!
//! ## Architecture
//!
//! - [`checksum`] — the base-35 rolling-XOR checksum shared by every frame kind
//! - [`frame`] — the wire codec: classification, parsing, building
//! - [`entities`] — the home-automation bus adapter and its entity catalogue
//! - [`config`] — the durable key/value config store
//! - [`admin`] — the device's line-oriented administration channel client
//! - [`destination_updater`] — keeps the device's telemetry destination pointed at the bridge
//! - [`relay`] — the MITM relay: the single UDP socket and its I/O loops
//! - [`synthesizer`] — produces command frames that stand in for the cloud
//! - [`supervisor`] — wires the above together and restarts them on fatal failure
//! - [`error`] — error types at each component boundary

pub mod admin;
pub mod checksum;
pub mod config;
pub mod destination_updater;
pub mod entities;
pub mod error;
pub mod frame;
pub mod relay;
pub mod supervisor;
pub mod synthesizer;
