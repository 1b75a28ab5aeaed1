use zbus::DBusError;

/// A D-Bus error surfaced to portal frontends.
///
/// Every variant maps to an error name under the
/// `org.freedesktop.portal.Error` prefix. Protocol violations are
/// `InvalidArgument`/`Exist`; failed authorization is deliberately reported
/// as `NotFound` so a caller cannot tell a foreign handle from an absent
/// one.
#[derive(DBusError, Debug)]
#[zbus(prefix = "org.freedesktop.portal.Error")]
pub enum PortalError {
    /// ZBus specific error.
    #[zbus(error)]
    ZBus(zbus::Error),
    /// Request failed.
    Failed(String),
    /// Invalid arguments passed.
    InvalidArgument(String),
    /// Not found.
    NotFound(String),
    /// Exists already.
    Exist(String),
    /// Not allowed.
    NotAllowed(String),
    /// Cancelled.
    Cancelled(String),
}

impl From<zbus::fdo::Error> for PortalError {
    fn from(e: zbus::fdo::Error) -> Self {
        Self::ZBus(zbus::Error::FDO(Box::new(e)))
    }
}

impl From<zbus::zvariant::Error> for PortalError {
    fn from(e: zbus::zvariant::Error) -> Self {
        Self::ZBus(zbus::Error::Variant(e))
    }
}
