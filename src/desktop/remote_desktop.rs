//! Wire types of the `org.freedesktop.impl.portal.RemoteDesktop` interface.

use std::fmt::Debug;

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use zbus::zvariant::{
    as_value::{self, optional},
    Type,
};

use super::screencast::Stream;

/// A bit flag for the available devices.
#[bitflags]
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Type)]
#[repr(u32)]
pub enum DeviceType {
    /// A keyboard.
    Keyboard,
    /// A mouse pointer.
    Pointer,
    /// A touchscreen.
    Touchscreen,
}

/// Options received with a `SelectDevices` call.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct SelectDevicesOptions {
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    types: Option<BitFlags<DeviceType>>,
}

impl SelectDevicesOptions {
    /// The device types the client asks to control.
    pub fn types(&self) -> Option<BitFlags<DeviceType>> {
        self.types
    }

    /// Sets the device types to request.
    #[must_use]
    pub fn set_types(mut self, types: impl Into<Option<BitFlags<DeviceType>>>) -> Self {
        self.types = types.into();
        self
    }
}

/// A `SelectDevices` reply carries no results.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct SelectDevicesResponse {}

/// Options received with a remote desktop `Start` call.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct StartRemoteOptions {}

/// The results of a successful remote desktop `Start`: the granted devices
/// and, for combined casts, the negotiated streams.
#[derive(Serialize, Deserialize, Type)]
#[zvariant(signature = "dict")]
pub struct Devices {
    #[serde(with = "as_value")]
    devices: BitFlags<DeviceType>,
    #[serde(default, with = "as_value", skip_serializing_if = "Vec::is_empty")]
    streams: Vec<Stream>,
}

impl Devices {
    /// The granted devices.
    pub fn devices(&self) -> BitFlags<DeviceType> {
        self.devices
    }

    /// The streams of a combined screen cast, if any.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }
}

impl Debug for Devices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Devices")
            .field("devices", &self.devices)
            .field("streams", &self.streams)
            .finish()
    }
}

/// A [builder-pattern] type to construct [`Devices`].
///
/// [builder-pattern]: https://doc.rust-lang.org/1.0.0/style/ownership/builders.html
pub struct DevicesBuilder {
    response: Devices,
}

impl DevicesBuilder {
    /// Create a new instance of a devices builder.
    pub fn new(devices: BitFlags<DeviceType>) -> Self {
        Self {
            response: Devices {
                devices,
                streams: Vec::new(),
            },
        }
    }

    /// Set the streams of a combined screen cast.
    #[must_use]
    pub fn streams(mut self, streams: Vec<Stream>) -> Self {
        self.response.streams = streams;
        self
    }

    /// Build the [`Devices`].
    pub fn build(self) -> Devices {
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_bits() {
        assert_eq!(BitFlags::from(DeviceType::Keyboard).bits(), 1);
        assert_eq!(BitFlags::from(DeviceType::Pointer).bits(), 2);
        assert_eq!(BitFlags::from(DeviceType::Touchscreen).bits(), 4);
    }

    #[test]
    fn devices_builder() {
        let devices = DevicesBuilder::new(DeviceType::Keyboard | DeviceType::Pointer).build();
        assert_eq!(devices.devices().bits(), 3);
        assert!(devices.streams().is_empty());
    }
}
