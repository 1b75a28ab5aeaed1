//! Wire types of the `org.freedesktop.impl.portal.Inhibit` interface.

use enumflags2::bitflags;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use zbus::zvariant::{as_value, Type};

/// A bit flag of what an inhibitor suppresses.
#[bitflags]
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Copy, Clone, Debug, Type)]
#[repr(u32)]
pub enum InhibitFlags {
    /// Logout.
    Logout,
    /// User switch.
    UserSwitch,
    /// Suspend.
    Suspend,
    /// Idle.
    Idle,
}

/// Options received with an `Inhibit` call.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct InhibitOptions {
    #[serde(
        default,
        with = "zbus::zvariant::as_value::optional",
        skip_serializing_if = "Option::is_none"
    )]
    reason: Option<String>,
}

impl InhibitOptions {
    /// The user-visible reason for the inhibition.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// A `CreateMonitor` reply carries no results.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct CreateMonitorResponse {}

/// The state of the login session, reported by `StateChanged`.
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Copy, Clone, Debug, Type)]
#[repr(u32)]
pub enum SessionState {
    /// The session is running.
    Running = 1,
    /// The session is about to end; inhibitors are being queried.
    QueryEnd = 2,
    /// The session is ending.
    Ending = 3,
}

/// The payload of the `StateChanged` signal.
#[derive(Serialize, Deserialize, Type, Debug)]
#[zvariant(signature = "dict")]
pub struct InhibitState {
    #[serde(rename = "screensaver-active", with = "as_value")]
    screensaver_active: bool,
    #[serde(rename = "session-state", with = "as_value")]
    session_state: SessionState,
}

impl InhibitState {
    pub(crate) fn new(screensaver_active: bool, session_state: SessionState) -> Self {
        Self {
            screensaver_active,
            session_state,
        }
    }

    /// Whether the screensaver is active.
    pub fn screensaver_active(&self) -> bool {
        self.screensaver_active
    }

    /// The state of the login session.
    pub fn session_state(&self) -> SessionState {
        self.session_state
    }
}

#[cfg(test)]
mod tests {
    use enumflags2::BitFlags;

    use super::*;

    #[test]
    fn inhibit_flag_bits() {
        assert_eq!(BitFlags::from(InhibitFlags::Logout).bits(), 1);
        assert_eq!(BitFlags::from(InhibitFlags::UserSwitch).bits(), 2);
        assert_eq!(BitFlags::from(InhibitFlags::Suspend).bits(), 4);
        assert_eq!(BitFlags::from(InhibitFlags::Idle).bits(), 8);
    }
}
