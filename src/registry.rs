//! The process-wide table of live object handles.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
};

use zbus::names::OwnedUniqueName;
use zbus::zvariant::OwnedObjectPath;

use crate::{
    backend::session::{Session, SessionKind},
    AppID, PortalError,
};

enum Owner {
    Request,
    Session(Arc<Session>),
}

struct Entry {
    owner: Owner,
    sender: Option<OwnedUniqueName>,
    app_id: Option<AppID>,
}

/// Maps an object handle to the in-flight request or
/// [`Session`](crate::backend::session::Session) owning it.
///
/// At most one live owner holds a given handle at a time; entries are
/// inserted when the owner is exported and removed as the last step before
/// it is torn down, so a lookup racing a close observes either the live
/// owner or nothing. Lookups are authorized: a handle created by one
/// client is not discoverable by another, and every failure mode reports
/// the same "not found".
#[derive(Default)]
pub(crate) struct HandleRegistry {
    entries: Mutex<HashMap<OwnedObjectPath, Entry>>,
}

impl HandleRegistry {
    /// Record a request handle. Fails if the handle is in use by a live
    /// owner; server-generated handles never collide, a buggy or malicious
    /// client reusing a session handle can.
    pub fn register_request(
        &self,
        handle: OwnedObjectPath,
        sender: Option<OwnedUniqueName>,
        app_id: Option<AppID>,
    ) -> Result<(), PortalError> {
        self.insert(
            handle,
            Entry {
                owner: Owner::Request,
                sender,
                app_id,
            },
        )
    }

    /// Record a session under its client-chosen handle.
    pub fn register_session(&self, session: Arc<Session>) -> Result<(), PortalError> {
        let handle = session.path().clone();
        let sender = session.sender().cloned();
        let app_id = session.app_id().cloned();
        self.insert(
            handle,
            Entry {
                owner: Owner::Session(session),
                sender,
                app_id,
            },
        )
    }

    fn insert(&self, handle: OwnedObjectPath, entry: Entry) -> Result<(), PortalError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&handle) {
            let message = format!("A handle `{}` already exists", handle.as_str());
            tracing::error!("HandleRegistry: {message}");
            return Err(PortalError::Exist(message));
        }
        entries.insert(handle, entry);
        Ok(())
    }

    /// Cheap pre-check before doing compositor I/O on behalf of a new
    /// session; `register_session` stays the authoritative gate.
    pub fn ensure_vacant(&self, handle: &OwnedObjectPath) -> Result<(), PortalError> {
        if self.entries.lock().unwrap().contains_key(handle) {
            Err(PortalError::Exist(format!(
                "A handle `{}` already exists",
                handle.as_str()
            )))
        } else {
            Ok(())
        }
    }

    /// Drop a handle. A no-op when absent, so racing close paths may both
    /// unregister without error.
    pub fn unregister(&self, handle: &OwnedObjectPath) {
        if self.entries.lock().unwrap().remove(handle).is_none() {
            tracing::debug!(
                "HandleRegistry: unregister of unknown handle `{}`",
                handle.as_str()
            );
        }
    }

    /// Look a session up by handle, verifying the caller may see it.
    ///
    /// An unconfined caller (no app id) acts as a trusted intermediary and
    /// passes the app check. An absent handle, a request handle, and a
    /// foreign session all report the same `NotFound`.
    pub fn lookup_session(
        &self,
        sender: Option<&str>,
        app_id: Option<&AppID>,
        handle: &OwnedObjectPath,
    ) -> Result<Arc<Session>, PortalError> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(handle).ok_or_else(|| not_found(handle))?;
        authorize(entry, sender, app_id).map_err(|_| not_found(handle))?;
        match &entry.owner {
            Owner::Session(session) => Ok(Arc::clone(session)),
            Owner::Request => Err(not_found(handle)),
        }
    }

    /// Look a session up and recover its concrete kind.
    pub fn lookup_session_as<K: SessionKind>(
        &self,
        sender: Option<&str>,
        app_id: Option<&AppID>,
        handle: &OwnedObjectPath,
    ) -> Result<(Arc<Session>, Arc<K>), PortalError> {
        let session = self.lookup_session(sender, app_id, handle)?;
        let kind = session.kind_as::<K>().ok_or_else(|| not_found(handle))?;
        Ok((session, kind))
    }

    /// Verify that `sender` may close the request registered at `handle`.
    pub fn authorize_request(
        &self,
        sender: Option<&str>,
        handle: &OwnedObjectPath,
    ) -> Result<(), PortalError> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(handle).ok_or_else(|| not_found(handle))?;
        match entry.owner {
            Owner::Request => authorize(entry, sender, None).map_err(|_| not_found(handle)),
            Owner::Session(_) => Err(not_found(handle)),
        }
    }
}

pub(crate) fn not_found(handle: &OwnedObjectPath) -> PortalError {
    PortalError::NotFound(format!("Unknown handle: `{}`", handle.as_str()))
}

fn authorize(entry: &Entry, sender: Option<&str>, app_id: Option<&AppID>) -> Result<(), ()> {
    if let (Some(recorded), Some(caller)) = (entry.sender.as_ref(), sender) {
        if recorded.as_str() != caller {
            return Err(());
        }
    }
    match app_id {
        // Unconfined callers act as trusted intermediaries.
        None => Ok(()),
        Some(caller) => {
            if entry.app_id.as_ref() == Some(caller) {
                Ok(())
            } else {
                Err(())
            }
        }
    }
}

impl Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.lock().unwrap().keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::session::tests::{session_path, CountingKind};
    use crate::backend::session::SessionKind;

    fn app(id: &str) -> AppID {
        id.parse().unwrap()
    }

    fn make_session(token: &str, app_id: Option<AppID>) -> Arc<Session> {
        Session::new(
            session_path(token),
            None,
            app_id,
            CountingKind::new() as Arc<dyn SessionKind>,
        )
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let registry = HandleRegistry::default();
        let session = make_session("dup", None);
        registry.register_session(Arc::clone(&session)).unwrap();
        assert!(matches!(
            registry.register_session(session),
            Err(PortalError::Exist(_))
        ));
    }

    #[test]
    fn unregister_tolerates_absent_handles() {
        let registry = HandleRegistry::default();
        // Racing close paths may both unregister.
        registry.unregister(&session_path("gone"));
        registry.unregister(&session_path("gone"));
    }

    #[test]
    fn lookup_is_isolated_per_app() {
        let registry = HandleRegistry::default();
        let session = make_session("auth", Some(app("org.foo.App")));
        registry.register_session(session).unwrap();

        let handle = session_path("auth");
        // The creator sees it.
        assert!(registry
            .lookup_session(None, Some(&app("org.foo.App")), &handle)
            .is_ok());
        // An unconfined caller sees it.
        assert!(registry.lookup_session(None, None, &handle).is_ok());
        // Another app gets the same answer as for an absent handle.
        let foreign = registry
            .lookup_session(None, Some(&app("org.bar.Other")), &handle)
            .unwrap_err();
        let absent = registry
            .lookup_session(None, None, &session_path("absent"))
            .unwrap_err();
        assert!(matches!(foreign, PortalError::NotFound(_)));
        assert!(matches!(absent, PortalError::NotFound(_)));
        // And the session is still registered afterwards.
        assert!(registry.lookup_session(None, None, &handle).is_ok());
    }

    #[test]
    fn kind_mismatch_reads_as_not_found() {
        let registry = HandleRegistry::default();
        registry
            .register_request(session_path("req"), None, None)
            .unwrap();
        assert!(matches!(
            registry.lookup_session(None, None, &session_path("req")),
            Err(PortalError::NotFound(_))
        ));
    }
}
