use std::sync::Arc;

use enumflags2::BitFlags;
use futures_util::{
    task::{Spawn, SpawnExt},
    StreamExt,
};
use zbus::names::{OwnedWellKnownName, WellKnownName};

use crate::{
    backend::{
        inhibit::InhibitInterface, remote_desktop::RemoteDesktopInterface,
        screencast::ScreenCastInterface, Result, DESKTOP_PATH,
    },
    compositor::{self, Compositor},
    consent::ConsentDialog,
    registry::HandleRegistry,
    PortalError,
};

/// Assembles and serves a portal backend: pick the portals, hand in a
/// consent dialog, get the interfaces exported and the well-known name
/// acquired.
///
/// ```no_run
/// # use waypost::{backend::Builder, consent::{ConsentDialog, ConsentOutcome, ConsentRequest}};
/// # use async_trait::async_trait;
/// struct Picker;
///
/// #[async_trait]
/// impl ConsentDialog for Picker {
///     async fn present(&self, _request: ConsentRequest) -> ConsentOutcome {
///         ConsentOutcome::Declined
///     }
/// }
///
/// # async fn run() -> waypost::Result<()> {
/// Builder::new("org.freedesktop.impl.portal.desktop.waypost")?
///     .consent(Picker)
///     .screen_cast()
///     .remote_desktop()
///     .inhibit()
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Builder {
    name: OwnedWellKnownName,
    flags: BitFlags<zbus::fdo::RequestNameFlags>,
    compositor_service: String,
    consent: Option<Arc<dyn ConsentDialog>>,
    screen_cast: bool,
    remote_desktop: bool,
    inhibit: bool,
    spawn: Option<Arc<dyn Spawn + Send + Sync + 'static>>,
    name_lost: Option<Arc<dyn Fn() + Send + Sync + 'static>>,
}

impl Builder {
    /// Start building a backend owning `well_known_name`.
    pub fn new<'a, W>(well_known_name: W) -> zbus::Result<Self>
    where
        W: TryInto<WellKnownName<'a>>,
        <W as TryInto<WellKnownName<'a>>>::Error: Into<zbus::Error>,
    {
        let well_known_name = well_known_name.try_into().map_err(Into::into)?;
        Ok(Self {
            name: well_known_name.into(),
            // same flags as zbus::Connection::request_name
            flags: zbus::fdo::RequestNameFlags::ReplaceExisting
                | zbus::fdo::RequestNameFlags::DoNotQueue,
            compositor_service: compositor::DEFAULT_SERVICE.to_string(),
            consent: None,
            screen_cast: false,
            remote_desktop: false,
            inhibit: false,
            spawn: None,
            name_lost: None,
        })
    }

    /// Override the name-request flags.
    pub fn with_flags(mut self, flags: BitFlags<zbus::fdo::RequestNameFlags>) -> Self {
        self.flags = flags;
        self
    }

    /// The consent dialog presented by the capture portals. Required when
    /// either of them is enabled.
    pub fn consent(mut self, dialog: impl ConsentDialog + 'static) -> Self {
        self.consent = Some(Arc::new(dialog));
        self
    }

    /// Talk to a capture service under a non-default well-known name.
    pub fn compositor_service(mut self, service: impl Into<String>) -> Self {
        self.compositor_service = service.into();
        self
    }

    /// Serve `org.freedesktop.impl.portal.ScreenCast`.
    pub fn screen_cast(mut self) -> Self {
        self.screen_cast = true;
        self
    }

    /// Serve `org.freedesktop.impl.portal.RemoteDesktop`.
    pub fn remote_desktop(mut self) -> Self {
        self.remote_desktop = true;
        self
    }

    /// Serve `org.freedesktop.impl.portal.Inhibit`.
    pub fn inhibit(mut self) -> Self {
        self.inhibit = true;
        self
    }

    /// Provide the executor used for background tasks.
    #[cfg(not(feature = "tokio"))]
    pub fn with_spawn(mut self, spawn: impl Spawn + Send + Sync + 'static) -> Self {
        self.spawn = Some(Arc::new(spawn));
        self
    }

    /// Invoked when the well-known name is lost to a replacement backend.
    pub fn with_name_lost(mut self, name_lost: impl Fn() + Send + Sync + 'static) -> Self {
        self.name_lost = Some(Arc::new(name_lost));
        self
    }

    /// Connect to the session bus and serve.
    pub async fn build(self) -> Result<()> {
        let connection = zbus::Connection::session().await?;
        self.build_with_connection(connection).await
    }

    /// Serve on an existing connection.
    pub async fn build_with_connection(self, connection: zbus::Connection) -> Result<()> {
        #[cfg(feature = "tokio")]
        let spawn = self
            .spawn
            .unwrap_or(Arc::new(super::spawn::TokioSpawner));

        #[cfg(not(feature = "tokio"))]
        let spawn = self
            .spawn
            .ok_or_else(|| PortalError::Failed("Must provide a spawner".to_string()))?;

        if let Some(name_lost) = self.name_lost {
            let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
            let mut name_lost_stream = proxy.receive_name_lost().await?;
            if let Err(error) = spawn.spawn(async move {
                while (name_lost_stream.next().await).is_some() {
                    name_lost();
                }
            }) {
                return Err(PortalError::Failed(error.to_string()));
            }
        }

        let registry = Arc::new(HandleRegistry::default());
        let object_server = connection.object_server();

        if self.screen_cast || self.remote_desktop {
            let consent = self.consent.ok_or_else(|| {
                PortalError::Failed(
                    "The capture portals require a consent dialog".to_string(),
                )
            })?;
            let compositor =
                Compositor::with_service(&connection, &self.compositor_service).await?;

            if self.screen_cast {
                let portal = ScreenCastInterface::new(
                    connection.clone(),
                    Arc::clone(&registry),
                    compositor.clone(),
                    Arc::clone(&consent),
                    Arc::clone(&spawn),
                );
                tracing::debug!("Serving interface `org.freedesktop.impl.portal.ScreenCast`");
                object_server.at(DESKTOP_PATH, portal).await?;
            }

            if self.remote_desktop {
                let portal = RemoteDesktopInterface::new(
                    connection.clone(),
                    Arc::clone(&registry),
                    compositor,
                    consent,
                    Arc::clone(&spawn),
                );
                tracing::debug!("Serving interface `org.freedesktop.impl.portal.RemoteDesktop`");
                object_server.at(DESKTOP_PATH, portal).await?;
            }
        }

        if self.inhibit {
            let portal = InhibitInterface::new(connection.clone(), Arc::clone(&registry));
            tracing::debug!("Serving interface `org.freedesktop.impl.portal.Inhibit`");
            object_server.at(DESKTOP_PATH, portal).await?;
        }

        connection
            .request_name_with_flags(self.name, self.flags)
            .await?;

        Ok(())
    }
}
