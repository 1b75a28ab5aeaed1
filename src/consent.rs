//! The contract between the start coordination and the user-facing consent
//! dialog.
//!
//! The dialog itself is supplied by the embedding backend (a GTK picker, a
//! layer-shell surface, whatever fits the desktop); this crate only defines
//! what goes in and the exactly-one terminal outcome that comes back. The
//! dialog performs no bus I/O.

use async_trait::async_trait;
use enumflags2::BitFlags;

use crate::{
    desktop::{
        remote_desktop::DeviceType,
        request::ResponseType,
        screencast::{CursorMode, SourceType},
    },
    AppID, WindowIdentifierType,
};

/// What the consent dialog should offer for selection.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    /// The application asking to capture, if known.
    pub app_id: Option<AppID>,
    /// The window the dialog should be transient for, if any.
    pub parent_window: Option<WindowIdentifierType>,
    /// The source types the application asked for.
    pub source_types: BitFlags<SourceType>,
    /// The device types the application asked for (remote desktop only).
    pub device_types: BitFlags<DeviceType>,
    /// Whether selecting more than one source is allowed.
    pub multiple: bool,
    /// How the cursor will be drawn in the resulting streams.
    pub cursor_mode: CursorMode,
}

/// One capture source picked by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectedSource {
    /// A monitor, named by its output connector ("DP-1", "eDP-1", …).
    Monitor {
        /// The output connector name.
        connector: String,
    },
    /// A window, named by a compositor-side identifier.
    Window {
        /// The compositor window id.
        id: u64,
    },
}

/// What the user granted.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// The capture sources to open, in dialog order.
    pub sources: Vec<SelectedSource>,
    /// The granted devices (remote desktop only).
    pub devices: BitFlags<DeviceType>,
}

/// The single terminal outcome of a consent dialog.
#[derive(Debug, Clone)]
pub enum ConsentOutcome {
    /// The user accepted and made a selection.
    Accepted(Selection),
    /// The user explicitly declined.
    Declined,
    /// The dialog window was dismissed without an explicit choice.
    Dismissed,
}

impl ConsentOutcome {
    /// The response code this outcome maps to: accept `0`, decline `1`,
    /// dismiss `2`.
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::Accepted(_) => ResponseType::Success,
            Self::Declined => ResponseType::Cancelled,
            Self::Dismissed => ResponseType::Other,
        }
    }
}

/// A user-facing source/device picker.
///
/// `present` must report exactly one terminal outcome; dropping the future
/// before it resolves tears the dialog down without a report (the caller
/// has already settled the request some other way).
#[async_trait]
pub trait ConsentDialog: Send + Sync {
    /// Present the dialog and wait for the user's choice.
    async fn present(&self, request: ConsentRequest) -> ConsentOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes() {
        assert_eq!(
            ConsentOutcome::Accepted(Selection::default()).response_type(),
            ResponseType::Success
        );
        assert_eq!(
            ConsentOutcome::Declined.response_type(),
            ResponseType::Cancelled
        );
        assert_eq!(
            ConsentOutcome::Dismissed.response_type(),
            ResponseType::Other
        );
    }
}
