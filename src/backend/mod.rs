//! The bus-facing backend objects: portal interfaces, request and session
//! lifecycles, and the start coordination.

use serde::{de::Deserializer, Deserialize};
use zbus::zvariant::Type;

use crate::{AppID, WindowIdentifierType};

/// Alias for a [`Result`] carrying a [`PortalError`](crate::PortalError).
pub type Result<T> = std::result::Result<T, crate::error::PortalError>;

/// A window identifier as received on the bus: the empty string and
/// malformed identifiers both deserialize to `None`.
#[derive(Debug, Default, Type)]
#[zvariant(signature = "s")]
pub(crate) struct MaybeWindowIdentifier(Option<WindowIdentifierType>);

impl MaybeWindowIdentifier {
    pub fn inner(self) -> Option<WindowIdentifierType> {
        self.0
    }
}

impl<'de> Deserialize<'de> for MaybeWindowIdentifier {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        if inner.is_empty() {
            Ok(Self(None))
        } else {
            Ok(Self(inner.parse::<WindowIdentifierType>().ok()))
        }
    }
}

/// An application id as received on the bus: the empty string (an
/// unconfined caller) deserializes to `None`.
#[derive(Debug, Default, Type)]
#[zvariant(signature = "s")]
pub(crate) struct MaybeAppID(Option<AppID>);

impl MaybeAppID {
    pub fn inner(self) -> Option<AppID> {
        self.0
    }
}

impl<'de> Deserialize<'de> for MaybeAppID {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = String::deserialize(deserializer)?;
        if inner.is_empty() {
            Ok(Self(None))
        } else {
            Ok(Self(inner.parse::<AppID>().ok()))
        }
    }
}

pub(crate) fn sender_of(header: &zbus::message::Header<'_>) -> Option<zbus::names::OwnedUniqueName> {
    header
        .sender()
        .map(|name| zbus::names::OwnedUniqueName::from(name.clone()))
}

mod builder;
pub use builder::Builder;
pub(crate) mod capture;
pub(crate) mod inhibit;
pub(crate) mod remote_desktop;
pub(crate) mod request;
pub(crate) mod screencast;
pub mod session;
mod spawn;
pub(crate) mod start;

/// The object path every portal interface is served at.
pub const DESKTOP_PATH: &str = "/org/freedesktop/portal/desktop";
