use std::{
    any::Any,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zbus::{
    names::OwnedUniqueName,
    object_server::SignalEmitter,
    zvariant::{as_value, OwnedObjectPath, Type},
};

use crate::{
    backend::Result, registry::HandleRegistry, AppID, HandleToken, PortalError,
};

/// Kind-specific behavior of a long-lived session.
///
/// Callers holding a generic [`Session`] invoke `close()` without knowing
/// the concrete kind; the registry recovers the concrete kind through
/// `as_any_arc` when a portal method needs it.
#[async_trait]
pub trait SessionKind: Send + Sync + 'static {
    /// Release kind-specific resources. Invoked at most once, from
    /// [`Session::close`].
    async fn close(&self);

    /// Upcast used for kind-checked retrieval.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A long-lived, multi-call resource held by a client: a capture session
/// or an inhibit monitor.
///
/// The session is exported on the bus at its client-chosen handle for its
/// whole lifetime and lives until the client closes it, the compositor
/// closes it underneath us, or the process shuts down.
pub struct Session {
    path: OwnedObjectPath,
    sender: Option<OwnedUniqueName>,
    app_id: Option<AppID>,
    closed: AtomicBool,
    kind: Arc<dyn SessionKind>,
}

impl Session {
    pub(crate) fn new(
        path: OwnedObjectPath,
        sender: Option<OwnedUniqueName>,
        app_id: Option<AppID>,
        kind: Arc<dyn SessionKind>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            sender,
            app_id,
            closed: AtomicBool::new(false),
            kind,
        })
    }

    /// The session's object path, i.e. its client-chosen handle.
    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    /// The handle token the session path ends with.
    pub fn token(&self) -> HandleToken {
        HandleToken::try_from(&self.path).unwrap()
    }

    pub(crate) fn sender(&self) -> Option<&OwnedUniqueName> {
        self.sender.as_ref()
    }

    pub(crate) fn app_id(&self) -> Option<&AppID> {
        self.app_id.as_ref()
    }

    /// Whether the session has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Retrieve the concrete kind, if it matches.
    pub(crate) fn kind_as<K: SessionKind>(&self) -> Option<Arc<K>> {
        Arc::downcast(Arc::clone(&self.kind).as_any_arc()).ok()
    }

    /// Close the session.
    ///
    /// Idempotent: the kind teardown runs exactly once even when a
    /// client-initiated close races the compositor's own `Closed` signal.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Closing session {}", self.path.as_str());
        self.kind.close().await;
    }

    /// Export the session object on the bus.
    pub(crate) async fn serve(
        self: &Arc<Self>,
        cnx: &zbus::Connection,
        registry: Arc<HandleRegistry>,
    ) -> Result<()> {
        let interface = SessionInterface {
            session: Arc::clone(self),
            registry,
        };
        tracing::debug!("Serving session object {}", self.path.as_str());
        match cnx.object_server().at(&self.path, interface).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(PortalError::Exist(format!(
                "A session object already exists at `{}`",
                self.path.as_str()
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Tear the session down after the compositor closed it on its own:
    /// emit `Closed` towards the client, then unregister and unexport.
    pub(crate) async fn remote_closed(
        self: &Arc<Self>,
        cnx: &zbus::Connection,
        registry: &HandleRegistry,
    ) {
        tracing::debug!(
            "Compositor closed session {} underneath us",
            self.path.as_str()
        );
        if let Ok(emitter) = SignalEmitter::new(cnx, &self.path) {
            if let Err(err) = SessionInterface::closed(&emitter).await {
                tracing::warn!("Failed to emit Closed on {}: {err}", self.path.as_str());
            }
        }
        registry.unregister(&self.path);
        self.close().await;
        if let Err(err) = cnx
            .object_server()
            .remove::<SessionInterface, _>(&self.path)
            .await
        {
            tracing::warn!(
                "Failed to unexport session {}: {err}",
                self.path.as_str()
            );
        }
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("app_id", &self.app_id)
            .finish()
    }
}

pub(crate) struct SessionInterface {
    session: Arc<Session>,
    registry: Arc<HandleRegistry>,
}

#[zbus::interface(name = "org.freedesktop.impl.portal.Session")]
impl SessionInterface {
    #[zbus(property(emits_changed_signal = "const"), name = "version")]
    fn version(&self) -> u32 {
        1
    }

    async fn close(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(object_server)] server: &zbus::ObjectServer,
    ) -> Result<()> {
        tracing::debug!("SessionInterface::Close {}", self.session.path().as_str());
        // A session must not be closable by anyone but its creator.
        self.registry.lookup_session(
            header.sender().map(|name| name.as_str()),
            None,
            self.session.path(),
        )?;

        // Update the registry before the object goes away so a racing
        // lookup sees either the live session or nothing.
        self.registry.unregister(self.session.path());
        self.session.close().await;
        // This method intentionally does *not* emit the `Closed` signal.
        server.remove::<Self, _>(self.session.path()).await?;
        Ok(())
    }

    #[zbus(signal)]
    pub(crate) async fn closed(signal_emitter: &SignalEmitter<'_>) -> zbus::Result<()>;
}

/// The results of a successful `CreateSession`.
#[derive(Serialize, Deserialize, Type, Debug)]
#[zvariant(signature = "dict")]
pub struct CreateSessionResponse {
    #[serde(with = "as_value")]
    session_id: HandleToken,
}

impl CreateSessionResponse {
    /// A response naming the created session.
    pub fn new(token: HandleToken) -> Self {
        Self { session_id: token }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures_util::FutureExt;

    use super::*;

    /// A session kind counting its teardowns.
    pub(crate) struct CountingKind {
        pub closes: AtomicUsize,
    }

    impl CountingKind {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SessionKind for CountingKind {
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    pub(crate) fn session_path(token: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(format!(
            "/org/freedesktop/portal/desktop/session/1_23/{token}"
        ))
        .unwrap()
    }

    #[test]
    fn close_runs_teardown_once() {
        let kind = CountingKind::new();
        let session = Session::new(
            session_path("s1"),
            None,
            Some("org.foo.App".parse().unwrap()),
            Arc::clone(&kind) as Arc<dyn SessionKind>,
        );

        // Simulate the client-initiated close racing the compositor's
        // Closed signal: both paths call close().
        session.close().now_or_never().unwrap();
        session.close().now_or_never().unwrap();

        assert_eq!(kind.closes.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());
    }

    #[test]
    fn kind_retrieval_is_type_checked() {
        let kind = CountingKind::new();
        let session = Session::new(
            session_path("s2"),
            None,
            None,
            Arc::clone(&kind) as Arc<dyn SessionKind>,
        );

        assert!(session.kind_as::<CountingKind>().is_some());

        struct OtherKind;
        #[async_trait]
        impl SessionKind for OtherKind {
            async fn close(&self) {}
            fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }
        assert!(session.kind_as::<OtherKind>().is_none());
    }
}
