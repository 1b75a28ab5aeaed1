use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use enumflags2::BitFlags;
use zbus::{object_server::SignalEmitter, zvariant::OwnedObjectPath};

use crate::{
    backend::{
        request::Request,
        sender_of,
        session::{Session, SessionKind},
        MaybeAppID, MaybeWindowIdentifier, Result,
    },
    desktop::{
        inhibit::{CreateMonitorResponse, InhibitFlags, InhibitOptions, InhibitState, SessionState},
        Response,
    },
    registry::HandleRegistry,
};

/// A session monitoring the login session state on behalf of a client.
///
/// Closing it forgets the monitor; there is no compositor half to stop.
pub(crate) struct InhibitSession {
    path: OwnedObjectPath,
    monitors: Arc<Mutex<HashSet<OwnedObjectPath>>>,
}

#[async_trait]
impl SessionKind for InhibitSession {
    async fn close(&self) {
        self.monitors.lock().unwrap().remove(&self.path);
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) struct InhibitInterface {
    cnx: zbus::Connection,
    registry: Arc<HandleRegistry>,
    /// Active inhibitors, keyed by the request handle holding them alive.
    inhibitors: Arc<Mutex<HashMap<OwnedObjectPath, BitFlags<InhibitFlags>>>>,
    monitors: Arc<Mutex<HashSet<OwnedObjectPath>>>,
}

impl InhibitInterface {
    pub fn new(cnx: zbus::Connection, registry: Arc<HandleRegistry>) -> Self {
        Self {
            cnx,
            registry,
            inhibitors: Arc::new(Mutex::new(HashMap::new())),
            monitors: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[zbus::interface(name = "org.freedesktop.impl.portal.Inhibit")]
impl InhibitInterface {
    #[zbus(property(emits_changed_signal = "const"), name = "version")]
    fn version(&self) -> u32 {
        1
    }

    /// Holds an inhibitor for as long as the request object lives; the
    /// client releases it by closing the request.
    #[zbus(name = "Inhibit")]
    async fn inhibit(
        &self,
        handle: OwnedObjectPath,
        app_id: MaybeAppID,
        _window: &str,
        flags: BitFlags<InhibitFlags>,
        options: InhibitOptions,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<()> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!(
            "Inhibit::Inhibit {} flags {} reason {:?}",
            handle.as_str(),
            flags.bits(),
            options.reason()
        );

        // Take effect before the request is discoverable, so a Close
        // always finds an inhibitor to release.
        self.inhibitors.lock().unwrap().insert(handle.clone(), flags);
        let inhibitors = Arc::clone(&self.inhibitors);
        let release_handle = handle.clone();
        let served = Request::serve_lasting(
            "Inhibit::Inhibit",
            &self.cnx,
            handle.clone(),
            sender,
            app_id,
            &self.registry,
            move || {
                // Runs exactly once, when the client closes the request.
                if inhibitors.lock().unwrap().remove(&release_handle).is_some() {
                    tracing::debug!("Released inhibitor {}", release_handle.as_str());
                }
            },
        )
        .await;
        if let Err(err) = served {
            self.inhibitors.lock().unwrap().remove(&handle);
            return Err(err);
        }
        Ok(())
    }

    #[zbus(name = "CreateMonitor")]
    #[zbus(out_args("response", "results"))]
    async fn create_monitor(
        &self,
        handle: OwnedObjectPath,
        session_handle: OwnedObjectPath,
        app_id: MaybeAppID,
        _window_identifier: MaybeWindowIdentifier,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<Response<CreateMonitorResponse>> {
        let app_id = app_id.inner();
        let sender = sender_of(&header);
        tracing::debug!("Inhibit::CreateMonitor {}", session_handle.as_str());
        self.registry.ensure_vacant(&session_handle)?;

        let cnx = self.cnx.clone();
        let registry = Arc::clone(&self.registry);
        let monitors = Arc::clone(&self.monitors);
        let fut_sender = sender.clone();
        let fut_app_id = app_id.clone();
        let monitor_path = session_handle.clone();
        let result = Request::spawn(
            "Inhibit::CreateMonitor",
            &self.cnx,
            handle,
            sender,
            app_id,
            &self.registry,
            async move {
                let kind = Arc::new(InhibitSession {
                    path: session_handle.clone(),
                    monitors: Arc::clone(&monitors),
                });
                let session = Session::new(
                    session_handle.clone(),
                    fut_sender,
                    fut_app_id,
                    kind as Arc<dyn SessionKind>,
                );
                registry.register_session(Arc::clone(&session))?;
                if let Err(err) = session.serve(&cnx, Arc::clone(&registry)).await {
                    registry.unregister(&session_handle);
                    return Err(err);
                }
                monitors.lock().unwrap().insert(session_handle);
                Ok(CreateMonitorResponse::default())
            },
        )
        .await;

        if let Ok(Response::Ok(_)) = &result {
            // Report the initial state right after the monitor exists.
            if let Err(err) = Self::state_changed(
                &emitter,
                monitor_path,
                InhibitState::new(false, SessionState::Running),
            )
            .await
            {
                tracing::warn!("Failed to emit initial StateChanged: {err}");
            }
        }

        result
    }

    #[zbus(name = "QueryEndResponse")]
    async fn query_end_response(
        &self,
        session_handle: OwnedObjectPath,
        #[zbus(header)] header: zbus::message::Header<'_>,
    ) -> Result<()> {
        let sender = sender_of(&header);
        self.registry.lookup_session_as::<InhibitSession>(
            sender.as_ref().map(|s| s.as_str()),
            None,
            &session_handle,
        )?;
        // The session-end handshake is acknowledged; with no session
        // manager behind us there is nothing further to do.
        Ok(())
    }

    #[zbus(signal)]
    async fn state_changed(
        signal_emitter: &SignalEmitter<'_>,
        session_handle: OwnedObjectPath,
        state: InhibitState,
    ) -> zbus::Result<()>;
}
