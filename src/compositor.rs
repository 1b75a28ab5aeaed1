//! Typed wrappers over the compositor's capture service.
//!
//! The compositor is an opaque collaborator: it owns rendering, pixel
//! capture and encoding. This module only adapts its D-Bus surface (a
//! service object creating sessions, session objects recording sources and
//! stream objects announcing PipeWire readiness) into typed calls and
//! signal streams.

use std::collections::HashMap;

use futures_util::{future::ready, Stream, StreamExt};
use zbus::zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, OwnedValue, Value};

use crate::PortalError;

/// The well-known name of the default capture service.
pub const DEFAULT_SERVICE: &str = "org.gnome.Mutter.ScreenCast";
/// The object path of the capture service.
pub const SERVICE_PATH: &str = "/org/gnome/Mutter/ScreenCast";

const SERVICE_INTERFACE: &str = "org.gnome.Mutter.ScreenCast";
const SESSION_INTERFACE: &str = "org.gnome.Mutter.ScreenCast.Session";
const STREAM_INTERFACE: &str = "org.gnome.Mutter.ScreenCast.Stream";

/// The capture service itself, used to create compositor-side sessions.
#[derive(Clone, Debug)]
pub struct Compositor {
    inner: zbus::Proxy<'static>,
    service: String,
}

impl Compositor {
    /// Connect to the default capture service on `connection`.
    pub async fn new(connection: &zbus::Connection) -> Result<Self, PortalError> {
        Self::with_service(connection, DEFAULT_SERVICE).await
    }

    /// Connect to a capture service under a custom well-known name.
    pub async fn with_service(
        connection: &zbus::Connection,
        service: &str,
    ) -> Result<Self, PortalError> {
        let inner = zbus::Proxy::new(
            connection,
            service.to_owned(),
            SERVICE_PATH,
            SERVICE_INTERFACE,
        )
        .await?;
        Ok(Self {
            inner,
            service: service.to_owned(),
        })
    }

    /// Create a compositor-side capture session.
    pub async fn create_session(&self) -> Result<CompositorSession, PortalError> {
        let path: OwnedObjectPath = self
            .inner
            .call("CreateSession", &(HashMap::<&str, Value<'_>>::new(),))
            .await?;
        tracing::debug!("Created compositor session {}", path.as_str());
        CompositorSession::from_path(self.inner.connection(), &self.service, path).await
    }
}

/// One compositor-side capture session.
#[derive(Clone, Debug)]
pub struct CompositorSession {
    inner: zbus::Proxy<'static>,
    service: String,
}

impl CompositorSession {
    async fn from_path(
        connection: &zbus::Connection,
        service: &str,
        path: OwnedObjectPath,
    ) -> Result<Self, PortalError> {
        let inner =
            zbus::Proxy::new(connection, service.to_owned(), path, SESSION_INTERFACE).await?;
        Ok(Self {
            inner,
            service: service.to_owned(),
        })
    }

    /// The session's object path at the compositor.
    pub fn path(&self) -> &ObjectPath<'_> {
        self.inner.path()
    }

    /// Start capturing on every recorded source.
    pub async fn start(&self) -> Result<(), PortalError> {
        self.inner.call("Start", &()).await.map_err(Into::into)
    }

    /// Stop the session and release every stream it carries.
    pub async fn stop(&self) -> Result<(), PortalError> {
        self.inner.call("Stop", &()).await.map_err(Into::into)
    }

    /// Ask the compositor to record a monitor, named by its connector.
    ///
    /// Fails if the connector does not name a current output.
    pub async fn record_monitor(
        &self,
        connector: &str,
        cursor_mode: u32,
    ) -> Result<CompositorStream, PortalError> {
        let mut properties = HashMap::<&str, Value<'_>>::new();
        properties.insert("cursor-mode", Value::from(cursor_mode));
        let path: OwnedObjectPath = self
            .inner
            .call("RecordMonitor", &(connector, properties))
            .await?;
        tracing::debug!(
            "Recording monitor `{connector}` as stream {}",
            path.as_str()
        );
        CompositorStream::from_path(self.inner.connection(), &self.service, path).await
    }

    /// Ask the compositor to record a window.
    pub async fn record_window(
        &self,
        window_id: u64,
        cursor_mode: u32,
    ) -> Result<CompositorStream, PortalError> {
        let mut properties = HashMap::<&str, Value<'_>>::new();
        properties.insert("window-id", Value::from(window_id));
        properties.insert("cursor-mode", Value::from(cursor_mode));
        let path: OwnedObjectPath = self.inner.call("RecordWindow", &(properties,)).await?;
        tracing::debug!("Recording window {window_id} as stream {}", path.as_str());
        CompositorStream::from_path(self.inner.connection(), &self.service, path).await
    }

    /// Open a file descriptor to the PipeWire remote carrying the session's
    /// streams.
    pub async fn open_pipe_wire_remote(&self) -> Result<OwnedFd, PortalError> {
        self.inner
            .call("OpenPipeWireRemote", &())
            .await
            .map_err(Into::into)
    }

    /// A stream yielding one item per `Closed` signal, i.e. when the
    /// compositor tears the session down on its own.
    pub async fn receive_closed(&self) -> Result<impl Stream<Item = ()> + 'static, PortalError> {
        Ok(self.inner.receive_signal("Closed").await?.map(|_msg| ()))
    }
}

/// One negotiated capture stream within a compositor session.
#[derive(Clone, Debug)]
pub struct CompositorStream {
    inner: zbus::Proxy<'static>,
}

impl CompositorStream {
    async fn from_path(
        connection: &zbus::Connection,
        service: &str,
        path: OwnedObjectPath,
    ) -> Result<Self, PortalError> {
        let inner =
            zbus::Proxy::new(connection, service.to_owned(), path, STREAM_INTERFACE).await?;
        Ok(Self { inner })
    }

    /// The stream's object path at the compositor.
    pub fn path(&self) -> &ObjectPath<'_> {
        self.inner.path()
    }

    /// A stream of `PipeWireStreamAdded` notifications, each carrying the
    /// PipeWire node id the capture is available under.
    ///
    /// Subscribe before awaiting anything else on the session; the
    /// notification may fire as soon as the compositor's `Start` returns.
    pub async fn receive_stream_added(
        &self,
    ) -> Result<impl Stream<Item = u32> + 'static, PortalError> {
        Ok(self
            .inner
            .receive_signal("PipeWireStreamAdded")
            .await?
            .filter_map(|msg| ready(msg.body().deserialize::<u32>().ok())))
    }

    /// The stream's `Parameters` property. Position and size are optional
    /// and missing entries are tolerated.
    pub async fn parameters(&self) -> StreamParameters {
        match self
            .inner
            .get_property::<HashMap<String, OwnedValue>>("Parameters")
            .await
        {
            Ok(map) => StreamParameters::from_dict(&map),
            Err(err) => {
                tracing::debug!(
                    "No parameters for stream {}: {err}",
                    self.inner.path().as_str()
                );
                StreamParameters::default()
            }
        }
    }
}

/// Optional geometry the compositor attaches to a stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamParameters {
    /// The stream's position in the compositor coordinate space.
    pub position: Option<(i32, i32)>,
    /// The stream's size in the compositor coordinate space.
    pub size: Option<(i32, i32)>,
}

impl StreamParameters {
    pub(crate) fn from_dict(map: &HashMap<String, OwnedValue>) -> Self {
        let position = map
            .get("position")
            .and_then(|value| value.try_clone().ok())
            .and_then(|owned| TryInto::<(i32, i32)>::try_into(owned).ok());
        let size = map
            .get("size")
            .and_then(|value| value.try_clone().ok())
            .and_then(|owned| TryInto::<(i32, i32)>::try_into(owned).ok());
        Self { position, size }
    }
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Value;

    use super::*;

    #[test]
    fn parameters_from_dict() {
        let mut map = HashMap::new();
        map.insert(
            "position".to_string(),
            OwnedValue::try_from(Value::new((0i32, 0i32))).unwrap(),
        );
        map.insert(
            "size".to_string(),
            OwnedValue::try_from(Value::new((2560i32, 1440i32))).unwrap(),
        );
        let params = StreamParameters::from_dict(&map);
        assert_eq!(params.position, Some((0, 0)));
        assert_eq!(params.size, Some((2560, 1440)));
    }

    #[test]
    fn parameters_tolerate_missing_entries() {
        let params = StreamParameters::from_dict(&HashMap::new());
        assert_eq!(params, StreamParameters::default());
    }
}
