#![cfg_attr(docsrs, feature(doc_cfg))]

//! # bt-audio-gateway — Bluetooth HSP/HFP Audio Gateway protocol core
//!
//! This crate implements the protocol-level core of a Bluetooth Audio Gateway (AG): the
//! peer connection lifecycle, the AT command framer and dispatcher, the HFP Service Level
//! Connection (SLC) handshake, the ring cadence scheduler, and the notification fan-out to
//! connected peers.
//!
//! It does **not** open Bluetooth sockets, build SDP records, or speak any particular IPC
//! wire format. Those concerns are modeled as collaborator traits ([`telephony::Telephony`],
//! [`transport::Transport`], [`control::ControlPlane`]) that an embedder supplies; this crate
//! drives them through the handshake and call-control flows defined by HSP and HFP 1.5.
//!
//! ## Crate features
//! * `serde`: enables serialization and deserialization of some data types.
//!
//! ## Basic usage
//! Construct a [`gateway::Gateway`] with a [`config::Config`] and implementations of the
//! three collaborator traits, register peers as their RFCOMM channel is discovered, and run
//! [`gateway::Gateway::run`] on a `tokio` runtime.

#![warn(missing_docs)]

use macaddr::MacAddr6;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};
use strum::EnumString;

#[doc(no_inline)]
pub use uuid::Uuid;
mod uuid_ext;
pub use uuid_ext::UuidExt;

pub mod ag;
pub mod broadcast;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod framer;
pub mod gateway;
pub mod handlers;
pub mod lifecycle;
pub mod peer;
pub mod ring;
pub mod slc;
pub mod telephony;
pub mod transport;

/// Audio gateway error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message, if any.
    pub message: String,
}

/// Audio gateway error kind.
///
/// These map directly onto the error tags surfaced on the control-plane collaborator
/// interface (see [`control::ControlPlane`]).
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ErrorKind {
    /// peer is not connected
    NotConnected,
    /// operation not available
    NotAvailable,
    /// operation already in progress
    InProgress,
    /// peer is already connected
    AlreadyConnected,
    /// operation not allowed
    NotAllowed,
    /// telephony collaborator is not ready
    NotReady,
    /// invalid argument
    InvalidArgument,
    /// operation failed
    Failed,
    /// connection attempt failed
    ConnectionAttemptFailed,
    /// operation not supported
    NotSupported,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error kind, not expected to be produced by correct collaborator implementations.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid UUID: {0}
    InvalidUuid(String),
    /// invalid value
    InvalidValue,
    /// channel to collaborator closed unexpectedly
    ChannelClosed,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::InvalidValue), message: String::new() }
    }
}

/// Audio gateway result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth device address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidArgument).tap_message(err.0)
    }
}

impl Error {
    fn tap_message(mut self, message: String) -> Self {
        self.message = message;
        self
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display_and_from_str() {
        let addr = Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
        let s = addr.to_string();
        assert_eq!(s, "00:1A:7D:DA:71:13");
        assert_eq!(s.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert!("not-an-address".parse::<Address>().is_err());
    }
}
