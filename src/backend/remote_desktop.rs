use std::sync::Arc;

use enumflags2::BitFlags;
use futures_channel::{mpsc, oneshot};
use futures_util::task::{Spawn, SpawnExt};
use zbus::zvariant::OwnedObjectPath;

use crate::{
    backend::{
        capture::{watch_compositor_closed, CaptureState, RemoteDesktopSession},
        request::Request,
        sender_of,
        session::{CreateSessionResponse, Session, SessionKind},
        start::{run_start, StartCoordinator, StartEvent, StartOutcome},
        MaybeAppID, MaybeWindowIdentifier, Result,
    },
    compositor::Compositor,
    consent::{ConsentDialog, ConsentRequest},
    desktop::{
        remote_desktop::{
            DeviceType, Devices, DevicesBuilder, SelectDevicesOptions, SelectDevicesResponse,
            StartRemoteOptions,
        },
        screencast::CreateSessionOptions,
        Response,
    },
    registry::HandleRegistry,
};

pub(crate) struct RemoteDesktopInterface {
    cnx: zbus::Connection,
    registry: Arc<HandleRegistry>,
    compositor: Compositor,
    consent: Arc<dyn ConsentDialog>,
    spawn: Arc<dyn Spawn + Send + Sync>,
}

impl RemoteDesktopInterface {
    pub fn new(
        cnx: zbus::Connection,
        registry: Arc<HandleRegistry>,
        compositor: Compositor,
        consent: Arc<dyn ConsentDialog>,
        spawn: Arc<dyn Spawn + Send + Sync>,
    ) -> Self {
        Self {
            cnx,
            registry,
            compositor,
            consent,
            spawn,
        }
    }
}

#[zbus::interface(name = "org.freedesktop.impl.portal.RemoteDesktop")]
impl RemoteDesktopInterface {
    #[zbus(property(emits_changed_signal = "const"), name = "AvailableDeviceTypes")]
    fn available_device_types(&self) -> u32 {
        (DeviceType::Keyboard | DeviceType::Pointer | DeviceType::Touchscreen).bits()
    }

    #[zbus(property(emits_changed_signal = "const"), name = "version")]
    fn version(&self) -> u32 {
        1
    }

    #[zbus(name = "CreateSession")]
    #[zbus(out_args("response", "results"))]
    async fn create_session(
        &self,
        handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: MaybeAppID,
        _options: CreateSessionOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<Response<CreateSessionResponse>> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!(
            "RemoteDesktop::CreateSession {} for {:?}",
            session_handle.as_str(),
            app_id
        );
        self.registry.ensure_vacant(&session_handle)?;

        let cnx = self.cnx.clone();
        let registry = Arc::clone(&self.registry);
        let compositor = self.compositor.clone();
        let spawn = Arc::clone(&self.spawn);
        let fut_sender = sender.clone();
        let fut_app_id = app_id.clone();
        Request::spawn(
            "RemoteDesktop::CreateSession",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            async move {
                let compositor_session = compositor.create_session().await?;
                let capture = CaptureState::new(compositor_session);
                let kind = RemoteDesktopSession::new(Arc::clone(&capture));
                let session = Session::new(
                    session_handle.clone(),
                    fut_sender,
                    fut_app_id,
                    kind as Arc<dyn SessionKind>,
                );
                if let Err(err) = registry.register_session(Arc::clone(&session)) {
                    let _ = capture.compositor().stop().await;
                    return Err(err);
                }
                if let Err(err) = session.serve(&cnx, Arc::clone(&registry)).await {
                    registry.unregister(&session_handle);
                    let _ = capture.compositor().stop().await;
                    return Err(err);
                }
                if let Err(err) = watch_compositor_closed(
                    &spawn,
                    cnx.clone(),
                    Arc::clone(&registry),
                    Arc::clone(&session),
                    &capture,
                ) {
                    tracing::warn!("{err}");
                }
                Ok(CreateSessionResponse::new(session.token()))
            },
        )
        .await
    }

    #[zbus(name = "SelectDevices")]
    #[zbus(out_args("response", "results"))]
    async fn select_devices(
        &self,
        handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: MaybeAppID,
        options: SelectDevicesOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<Response<SelectDevicesResponse>> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!(
            "RemoteDesktop::SelectDevices {}: {options:?}",
            session_handle.as_str()
        );
        let (_session, kind) = self.registry.lookup_session_as::<RemoteDesktopSession>(
            sender.as_ref().map(|s| s.as_str()),
            app_id.as_ref(),
            &session_handle,
        )?;

        let available =
            DeviceType::Keyboard | DeviceType::Pointer | DeviceType::Touchscreen;
        Request::spawn(
            "RemoteDesktop::SelectDevices",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            async move {
                kind.select_devices(available, options.types())?;
                Ok(SelectDevicesResponse::default())
            },
        )
        .await
    }

    #[zbus(name = "Start")]
    #[zbus(out_args("response", "results"))]
    async fn start(
        &self,
        handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: MaybeAppID,
        window_identifier: MaybeWindowIdentifier,
        _options: StartRemoteOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<Response<Devices>> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!("RemoteDesktop::Start {}", session_handle.as_str());
        let (_session, kind) = self.registry.lookup_session_as::<RemoteDesktopSession>(
            sender.as_ref().map(|s| s.as_str()),
            app_id.as_ref(),
            &session_handle,
        )?;
        let capture = Arc::clone(kind.capture());

        let (events_tx, events_rx) = mpsc::unbounded();
        capture.begin_start(events_tx.clone())?;

        let config = capture.config();
        let consent_request = ConsentRequest {
            app_id: app_id.clone(),
            parent_window: window_identifier.inner(),
            // Streams only when the client combined the session with a
            // source selection; a plain remote desktop shares devices
            // alone and takes the zero-stream path.
            source_types: if config.selected {
                config.types
            } else {
                BitFlags::empty()
            },
            device_types: kind.requested_devices(),
            multiple: config.multiple,
            cursor_mode: config.cursor_mode,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let coordinator = StartCoordinator::new(reply_tx, consent_request.clone());
        if let Err(err) = self.spawn.spawn(run_start(
            coordinator,
            events_rx,
            Arc::clone(&self.consent),
            consent_request,
            capture.compositor().clone(),
            config.cursor_mode,
        )) {
            capture.finish_start(false);
            return Err(crate::PortalError::Failed(format!(
                "Failed to spawn start coordination: {err}"
            )));
        }

        let close_tx = events_tx.clone();
        let result = Request::spawn_deferred(
            "RemoteDesktop::Start",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            move || {
                let _ = close_tx.unbounded_send(StartEvent::ClientClosed);
            },
            async move {
                let outcome = reply_rx.await.unwrap_or(StartOutcome::Aborted);
                Ok(match outcome {
                    StartOutcome::Granted { streams, devices } => {
                        Response::ok(DevicesBuilder::new(devices).streams(streams).build())
                    }
                    StartOutcome::Declined => Response::cancelled(),
                    StartOutcome::Aborted => Response::other(),
                })
            },
        )
        .await;

        let granted = matches!(&result, Ok(Response::Ok(_)));
        if !granted {
            let _ = events_tx.unbounded_send(StartEvent::ClientClosed);
        }
        capture.finish_start(granted);
        result
    }
}
