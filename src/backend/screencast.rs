use std::sync::Arc;

use enumflags2::BitFlags;
use futures_channel::{mpsc, oneshot};
use futures_util::task::{Spawn, SpawnExt};
use zbus::zvariant::{OwnedFd, OwnedObjectPath};

use crate::{
    backend::{
        capture::{
            watch_compositor_closed, CaptureState, RemoteDesktopSession, ScreencastSession,
        },
        request::Request,
        sender_of,
        session::{CreateSessionResponse, Session, SessionKind},
        start::{run_start, StartCoordinator, StartEvent, StartOutcome},
        MaybeAppID, MaybeWindowIdentifier, Result,
    },
    compositor::Compositor,
    consent::{ConsentDialog, ConsentRequest},
    desktop::{
        screencast::{
            CreateSessionOptions, CursorMode, OpenPipeWireRemoteOptions, SelectSourcesOptions,
            SelectSourcesResponse, SourceType, StartCastOptions, Streams, StreamsBuilder,
        },
        Response,
    },
    registry::{self, HandleRegistry},
    AppID,
};

pub(crate) struct ScreenCastInterface {
    cnx: zbus::Connection,
    registry: Arc<HandleRegistry>,
    compositor: Compositor,
    consent: Arc<dyn ConsentDialog>,
    spawn: Arc<dyn Spawn + Send + Sync>,
}

impl ScreenCastInterface {
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

    /// The capture state behind `session_handle`, for methods shared
    /// between plain casts and combined remote desktop casts.
    fn lookup_capture(
        &self,
        sender: Option<&str>,
        app_id: Option<&AppID>,
        handle: &OwnedObjectPath,
    ) -> Result<Arc<CaptureState>> {
        let session = self.registry.lookup_session(sender, app_id, handle)?;
        if let Some(kind) = session.kind_as::<ScreencastSession>() {
            return Ok(Arc::clone(kind.capture()));
        }
        if let Some(kind) = session.kind_as::<RemoteDesktopSession>() {
            return Ok(Arc::clone(kind.capture()));
        }
        Err(registry::not_found(handle))
    }
}

#[zbus::interface(name = "org.freedesktop.impl.portal.ScreenCast")]
impl ScreenCastInterface {
    #[zbus(property(emits_changed_signal = "const"), name = "AvailableSourceTypes")]
    fn available_source_types(&self) -> u32 {
        (SourceType::Monitor | SourceType::Window).bits()
    }

    #[zbus(property(emits_changed_signal = "const"), name = "AvailableCursorModes")]
    fn available_cursor_modes(&self) -> u32 {
        (CursorMode::Hidden | CursorMode::Embedded | CursorMode::Metadata).bits()
    }

    #[zbus(property(emits_changed_signal = "const"), name = "version")]
    fn version(&self) -> u32 {
        3
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
            "ScreenCast::CreateSession {} for {:?}",
            session_handle.as_str(),
            app_id
        );
        // Reject a reused session handle before touching the compositor.
        self.registry.ensure_vacant(&session_handle)?;

        let cnx = self.cnx.clone();
        let registry = Arc::clone(&self.registry);
        let compositor = self.compositor.clone();
        let spawn = Arc::clone(&self.spawn);
        let fut_sender = sender.clone();
        let fut_app_id = app_id.clone();
        Request::spawn(
            "ScreenCast::CreateSession",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            async move {
                let compositor_session = compositor.create_session().await?;
                let capture = CaptureState::new(compositor_session);
                let kind = ScreencastSession::new(Arc::clone(&capture));
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

    #[zbus(name = "SelectSources")]
    #[zbus(out_args("response", "results"))]
    async fn select_sources(
        &self,
        handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: MaybeAppID,
        options: SelectSourcesOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<Response<SelectSourcesResponse>> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!(
            "ScreenCast::SelectSources {}: {options:?}",
            session_handle.as_str()
        );
        let capture = self.lookup_capture(
            sender.as_ref().map(|s| s.as_str()),
            app_id.as_ref(),
            &session_handle,
        )?;

        let available_types = SourceType::Monitor | SourceType::Window;
        let available_cursor_modes =
            CursorMode::Hidden | CursorMode::Embedded | CursorMode::Metadata;
        Request::spawn(
            "ScreenCast::SelectSources",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            async move {
                capture.configure(available_types, available_cursor_modes, &options)?;
                Ok(SelectSourcesResponse::default())
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
        _options: StartCastOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<Response<Streams>> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!("ScreenCast::Start {}", session_handle.as_str());
        let (_session, kind) = self.registry.lookup_session_as::<ScreencastSession>(
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
            source_types: config.types,
            device_types: BitFlags::empty(),
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
            "ScreenCast::Start",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            move || {
                let _ = close_tx.unbounded_send(StartEvent::ClientClosed);
            },
            async move {
                // The driver resolves exactly once; if it dies without
                // doing so the client still gets a terminal reply.
                let outcome = reply_rx.await.unwrap_or(StartOutcome::Aborted);
                Ok(match outcome {
                    StartOutcome::Granted { streams, .. } => {
                        Response::ok(StreamsBuilder::new(streams).build())
                    }
                    StartOutcome::Declined => Response::cancelled(),
                    StartOutcome::Aborted => Response::other(),
                })
            },
        )
        .await;

        let granted = matches!(&result, Ok(Response::Ok(_)));
        if !granted {
            // Sending into a settled coordination is the guarded late
            // event, not a second cancellation.
            let _ = events_tx.unbounded_send(StartEvent::ClientClosed);
        }
        capture.finish_start(granted);
        result
    }

    #[zbus(name = "OpenPipeWireRemote")]
    async fn open_pipe_wire_remote(
        &self,
        session_handle: OwnedObjectPath,
        _options: OpenPipeWireRemoteOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<OwnedFd> {
        let sender = sender_of(&header);
        tracing::debug!("ScreenCast::OpenPipeWireRemote {}", session_handle.as_str());
        let capture =
            self.lookup_capture(sender.as_ref().map(|s| s.as_str()), None, &session_handle)?;
        capture.compositor().open_pipe_wire_remote().await
    }
}
