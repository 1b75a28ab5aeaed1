//! The in-flight, single-response, cancellable request object.
//!
//! A request is exported on the bus under its server-side handle the
//! moment the portal method starts handling it, so a client racing a
//! `Close` against the dialog has something to find. It leaves the bus
//! exactly once: either the method sends its final reply or the client's
//! `Close` wins, and both paths go through the same take-once close slot,
//! turning the race into last-writer-wins-once rather than a double
//! reply.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use futures_channel::oneshot;
use futures_util::{
    future::{select, Either},
    pin_mut,
};
use serde::Serialize;
use zbus::{names::OwnedUniqueName, zvariant::OwnedObjectPath, zvariant::Type};

use crate::{backend::Result, desktop::Response, registry::HandleRegistry, AppID, PortalError};

/// What the close slot does when the client calls `Close`.
enum OnClose {
    /// Cancel the pending operation outright; the method replies with
    /// response code 2.
    Cancel(oneshot::Sender<()>),
    /// Forward the close as an explicit event; the pending operation keeps
    /// running and settles the reply itself.
    Notify(Box<dyn FnOnce() + Send>),
    /// Run the release hook and tear the object down; used by requests
    /// that outlive their method call (inhibitors).
    Release(Box<dyn FnOnce() + Send>),
}

struct RequestState {
    close: Mutex<Option<OnClose>>,
}

/// Entry points for exporting request objects around portal method
/// handlers.
pub(crate) struct Request;

impl Request {
    /// Run `fut` with a request object exported at `handle`; a `Close`
    /// arriving first cancels `fut` and replies with response code 2.
    ///
    /// This is the shape of every one-shot configuration call
    /// (CreateSession, SelectSources, SelectDevices).
    pub(crate) async fn spawn<T, Fut>(
        name: &'static str,
        cnx: &zbus::Connection,
        handle: OwnedObjectPath,
        sender: Option<OwnedUniqueName>,
        app_id: Option<AppID>,
        registry: &Arc<HandleRegistry>,
        fut: Fut,
    ) -> Result<Response<T>>
    where
        T: Serialize + Type,
        Fut: Future<Output = Result<T>>,
    {
        let (close_tx, close_rx) = oneshot::channel();
        Self::serve(cnx, &handle, sender, app_id, registry, OnClose::Cancel(close_tx)).await?;
        tracing::debug!("{name}: handling request {}", handle.as_str());

        pin_mut!(fut);
        let response = match select(fut, close_rx).await {
            Either::Left((result, _)) => result.map(Response::ok),
            Either::Right((_, _)) => {
                tracing::debug!("{name}: request {} closed by the client", handle.as_str());
                Ok(Response::other())
            }
        };

        Self::release(cnx, &handle, registry).await;
        response
    }

    /// Run `fut` with a request object exported at `handle`; a `Close`
    /// invokes `on_close` and `fut` keeps running until it settles the
    /// reply itself.
    ///
    /// Used by `Start`, where cancellation must reach the coordinator as
    /// an explicit event rather than tear the work down from underneath
    /// it.
    pub(crate) async fn spawn_deferred<T, Fut>(
        name: &'static str,
        cnx: &zbus::Connection,
        handle: OwnedObjectPath,
        sender: Option<OwnedUniqueName>,
        app_id: Option<AppID>,
        registry: &Arc<HandleRegistry>,
        on_close: impl FnOnce() + Send + 'static,
        fut: Fut,
    ) -> Result<Response<T>>
    where
        T: Serialize + Type,
        Fut: Future<Output = Result<Response<T>>>,
    {
        Self::serve(
            cnx,
            &handle,
            sender,
            app_id,
            registry,
            OnClose::Notify(Box::new(on_close)),
        )
        .await?;
        tracing::debug!("{name}: handling request {}", handle.as_str());

        let response = fut.await;

        Self::release(cnx, &handle, registry).await;
        response
    }

    /// Export a request object that lives until the client closes it; the
    /// `Close` runs `on_close` and removes the object.
    ///
    /// Used by inhibitors, whose effect lasts for the lifetime of the
    /// request.
    pub(crate) async fn serve_lasting(
        name: &'static str,
        cnx: &zbus::Connection,
        handle: OwnedObjectPath,
        sender: Option<OwnedUniqueName>,
        app_id: Option<AppID>,
        registry: &Arc<HandleRegistry>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        Self::serve(
            cnx,
            &handle,
            sender,
            app_id,
            registry,
            OnClose::Release(Box::new(on_close)),
        )
        .await?;
        tracing::debug!("{name}: serving lasting request {}", handle.as_str());
        Ok(())
    }

    async fn serve(
        cnx: &zbus::Connection,
        handle: &OwnedObjectPath,
        sender: Option<OwnedUniqueName>,
        app_id: Option<AppID>,
        registry: &Arc<HandleRegistry>,
        on_close: OnClose,
    ) -> Result<()> {
        registry.register_request(handle.clone(), sender, app_id)?;
        let interface = RequestInterface {
            handle: handle.clone(),
            registry: Arc::clone(registry),
            state: Arc::new(RequestState {
                close: Mutex::new(Some(on_close)),
            }),
        };
        match cnx.object_server().at(handle, interface).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                registry.unregister(handle);
                Err(PortalError::Exist(format!(
                    "A request object already exists at `{}`",
                    handle.as_str()
                )))
            }
            Err(err) => {
                registry.unregister(handle);
                Err(err.into())
            }
        }
    }

    async fn release(cnx: &zbus::Connection, handle: &OwnedObjectPath, registry: &HandleRegistry) {
        // Unregister before the object goes away so a lookup racing this
        // teardown sees either the live request or nothing.
        registry.unregister(handle);
        tracing::debug!("Releasing request object {}", handle.as_str());
        if let Err(err) = cnx
            .object_server()
            .remove::<RequestInterface, _>(handle)
            .await
        {
            tracing::warn!("Failed to unexport request {}: {err}", handle.as_str());
        }
    }
}

pub(crate) struct RequestInterface {
    handle: OwnedObjectPath,
    registry: Arc<HandleRegistry>,
    state: Arc<RequestState>,
}

#[zbus::interface(name = "org.freedesktop.impl.portal.Request")]
impl RequestInterface {
    async fn close(
        &self,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(object_server)] server: &zbus::ObjectServer,
    ) -> Result<()> {
        // A request must not be closable by anyone but its creator.
        let sender = header.sender().map(|name| name.as_str());
        if let Err(err) = self.registry.authorize_request(sender, &self.handle) {
            // The registry forgets a request as the first step of its
            // release; a Close racing that teardown is benign.
            if self.state.close.lock().unwrap().is_none() {
                return Ok(());
            }
            return Err(err);
        }

        let taken = self.state.close.lock().unwrap().take();
        match taken {
            Some(OnClose::Cancel(tx)) => {
                // The pending method may have completed concurrently, in
                // which case the receiver is gone and this send is the
                // benign half of the race.
                let _ = tx.send(());
            }
            Some(OnClose::Notify(hook)) => hook(),
            Some(OnClose::Release(hook)) => {
                hook();
                self.registry.unregister(&self.handle);
                server.remove::<Self, _>(&self.handle).await?;
            }
            // Already completed or closed: a benign no-op, not an error.
            None => {
                tracing::debug!(
                    "Close on settled request {}, ignoring",
                    self.handle.as_str()
                );
            }
        }
        Ok(())
    }
}
