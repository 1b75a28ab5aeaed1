//! Shared state of the two capture-session kinds.
//!
//! Screen-cast and remote-desktop sessions carry the same capture
//! machinery: a compositor-side session, a validated source
//! configuration, at most one start in flight, and a watcher for the
//! compositor closing the session underneath us. The remote-desktop kind
//! adds a device selection on top.

use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use enumflags2::BitFlags;
use futures_channel::{mpsc::UnboundedSender, oneshot};
use futures_util::{
    future::{select, Either},
    pin_mut,
    task::{Spawn, SpawnExt},
    StreamExt,
};

use crate::{
    backend::{
        session::{Session, SessionKind},
        start::StartEvent,
    },
    compositor::CompositorSession,
    desktop::{
        remote_desktop::DeviceType,
        screencast::{CursorMode, SelectSourcesOptions, SourceType},
    },
    registry::HandleRegistry,
    PortalError,
};

/// Where a capture session is in its lifecycle.
///
/// Configuration calls only mutate intent and are rejected once a start
/// ran; `Starting` is the only phase performing compositor I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Configuring,
    Starting,
    Active,
    Closed,
}

/// The intended capture parameters, accumulated by `Select*` calls.
#[derive(Debug, Clone)]
pub(crate) struct SourceConfig {
    pub types: BitFlags<SourceType>,
    pub multiple: bool,
    pub cursor_mode: CursorMode,
    /// Whether `SelectSources` was actually called; a remote desktop
    /// session without it shares devices only.
    pub selected: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            types: SourceType::Monitor.into(),
            multiple: false,
            cursor_mode: CursorMode::Hidden,
            selected: false,
        }
    }
}

/// The lock-protected half of [`CaptureState`]: phase, configuration and
/// the conduits of the start in flight. Carries all the state logic and
/// no I/O.
struct CaptureControl {
    phase: SessionPhase,
    config: SourceConfig,
    active_start: Option<UnboundedSender<StartEvent>>,
    watcher_guard: Option<oneshot::Sender<()>>,
}

impl CaptureControl {
    fn new() -> Self {
        Self {
            phase: SessionPhase::Configuring,
            config: SourceConfig::default(),
            active_start: None,
            watcher_guard: None,
        }
    }

    fn configure(
        &mut self,
        available_types: BitFlags<SourceType>,
        available_cursor_modes: BitFlags<CursorMode>,
        options: &SelectSourcesOptions,
    ) -> Result<(), PortalError> {
        if self.phase != SessionPhase::Configuring {
            return Err(PortalError::InvalidArgument(
                "Sources can only be selected before the session is started".to_string(),
            ));
        }
        if let Some(types) = options.types() {
            if !available_types.contains(types) {
                return Err(PortalError::InvalidArgument(format!(
                    "Unsupported source types {}",
                    types.bits()
                )));
            }
            self.config.types = types;
        }
        if let Some(cursor_mode) = options.cursor_mode() {
            if !available_cursor_modes.contains(cursor_mode) {
                return Err(PortalError::InvalidArgument(format!(
                    "Unsupported cursor mode {}",
                    BitFlags::from(cursor_mode).bits()
                )));
            }
            self.config.cursor_mode = cursor_mode;
        }
        if let Some(multiple) = options.is_multiple() {
            self.config.multiple = multiple;
        }
        self.config.selected = true;
        Ok(())
    }

    fn begin_start(&mut self, events: UnboundedSender<StartEvent>) -> Result<(), PortalError> {
        if self.active_start.is_some() {
            return Err(PortalError::Exist(
                "A start is already in progress for this session".to_string(),
            ));
        }
        match self.phase {
            SessionPhase::Configuring => {
                self.phase = SessionPhase::Starting;
                self.active_start = Some(events);
                Ok(())
            }
            SessionPhase::Starting => Err(PortalError::Exist(
                "A start is already in progress for this session".to_string(),
            )),
            SessionPhase::Active => Err(PortalError::InvalidArgument(
                "The session is already started".to_string(),
            )),
            SessionPhase::Closed => Err(PortalError::InvalidArgument(
                "The session is closed".to_string(),
            )),
        }
    }

    fn finish_start(&mut self, granted: bool) {
        self.active_start = None;
        if self.phase == SessionPhase::Starting {
            self.phase = if granted {
                SessionPhase::Active
            } else {
                SessionPhase::Configuring
            };
        }
    }

    /// Enter `Closed` and hand back the conduits to fire, exactly once.
    fn close(&mut self) -> (Option<UnboundedSender<StartEvent>>, Option<oneshot::Sender<()>>) {
        self.phase = SessionPhase::Closed;
        (self.active_start.take(), self.watcher_guard.take())
    }
}

/// Capture bookkeeping shared by the screen-cast and remote-desktop
/// session kinds.
pub(crate) struct CaptureState {
    compositor: CompositorSession,
    control: Mutex<CaptureControl>,
}

impl CaptureState {
    pub fn new(compositor: CompositorSession) -> Arc<Self> {
        Arc::new(Self {
            compositor,
            control: Mutex::new(CaptureControl::new()),
        })
    }

    pub fn compositor(&self) -> &CompositorSession {
        &self.compositor
    }

    /// Record the source selection. Only intent is stored; nothing
    /// touches the compositor until `Start`.
    pub fn configure(
        &self,
        available_types: BitFlags<SourceType>,
        available_cursor_modes: BitFlags<CursorMode>,
        options: &SelectSourcesOptions,
    ) -> Result<(), PortalError> {
        self.control
            .lock()
            .unwrap()
            .configure(available_types, available_cursor_modes, options)
    }

    pub fn config(&self) -> SourceConfig {
        self.control.lock().unwrap().config.clone()
    }

    /// Enter `Starting` and install the cancellation conduit of the new
    /// start. At most one start may be in flight per session.
    pub fn begin_start(&self, events: UnboundedSender<StartEvent>) -> Result<(), PortalError> {
        self.control.lock().unwrap().begin_start(events)
    }

    /// Leave `Starting`. A granted start makes the session active; a
    /// declined, cancelled or failed one returns it to `Configuring`.
    pub fn finish_start(&self, granted: bool) {
        self.control.lock().unwrap().finish_start(granted)
    }

    fn set_watcher_guard(&self, guard: oneshot::Sender<()>) {
        self.control.lock().unwrap().watcher_guard = Some(guard);
    }

    /// Kind teardown shared by both capture kinds: cancel a pending
    /// start, stop watching the compositor, stop the compositor session.
    async fn teardown(&self) {
        let (active_start, watcher_guard) = self.control.lock().unwrap().close();
        if let Some(events) = active_start {
            let _ = events.unbounded_send(StartEvent::ClientClosed);
        }
        if let Some(guard) = watcher_guard {
            let _ = guard.send(());
        }
        if let Err(err) = self.compositor.stop().await {
            tracing::debug!(
                "Stopping compositor session {} failed: {err}",
                self.compositor.path().as_str()
            );
        }
    }
}

/// A screen cast session.
pub(crate) struct ScreencastSession {
    capture: Arc<CaptureState>,
}

impl ScreencastSession {
    pub fn new(capture: Arc<CaptureState>) -> Arc<Self> {
        Arc::new(Self { capture })
    }

    pub fn capture(&self) -> &Arc<CaptureState> {
        &self.capture
    }
}

#[async_trait]
impl SessionKind for ScreencastSession {
    async fn close(&self) {
        self.capture.teardown().await;
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A remote desktop session: capture machinery plus a device selection.
pub(crate) struct RemoteDesktopSession {
    capture: Arc<CaptureState>,
    devices: Mutex<BitFlags<DeviceType>>,
}

impl RemoteDesktopSession {
    pub fn new(capture: Arc<CaptureState>) -> Arc<Self> {
        Arc::new(Self {
            capture,
            devices: Mutex::new(DeviceType::Keyboard | DeviceType::Pointer),
        })
    }

    pub fn capture(&self) -> &Arc<CaptureState> {
        &self.capture
    }

    pub fn requested_devices(&self) -> BitFlags<DeviceType> {
        *self.devices.lock().unwrap()
    }

    pub fn select_devices(
        &self,
        available: BitFlags<DeviceType>,
        requested: Option<BitFlags<DeviceType>>,
    ) -> Result<(), PortalError> {
        if let Some(types) = requested {
            validate_devices(available, types)?;
            *self.devices.lock().unwrap() = types;
        }
        Ok(())
    }
}

fn validate_devices(
    available: BitFlags<DeviceType>,
    requested: BitFlags<DeviceType>,
) -> Result<(), PortalError> {
    if available.contains(requested) {
        Ok(())
    } else {
        Err(PortalError::InvalidArgument(format!(
            "Unsupported device types {}",
            requested.bits()
        )))
    }
}

#[async_trait]
impl SessionKind for RemoteDesktopSession {
    async fn close(&self) {
        self.capture.teardown().await;
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Watch for the compositor closing the session on its own; the first
/// `Closed` signal tears the portal session down and notifies the client.
/// Closing from our side fires the guard and just ends the watch.
pub(crate) fn watch_compositor_closed(
    spawn: &Arc<dyn Spawn + Send + Sync>,
    cnx: zbus::Connection,
    registry: Arc<HandleRegistry>,
    session: Arc<Session>,
    capture: &Arc<CaptureState>,
) -> Result<(), PortalError> {
    let (guard_tx, guard_rx) = oneshot::channel();
    capture.set_watcher_guard(guard_tx);
    let compositor = capture.compositor().clone();
    spawn
        .spawn(async move {
            let closed = match compositor.receive_closed().await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(
                        "Cannot watch compositor session {}: {err}",
                        compositor.path().as_str()
                    );
                    return;
                }
            };
            pin_mut!(closed);
            let first = closed.next();
            pin_mut!(first);
            match select(first, guard_rx).await {
                Either::Left((Some(()), _)) => {
                    session.remote_closed(&cnx, &registry).await;
                }
                Either::Left((None, _)) => {
                    tracing::debug!("compositor signal stream ended");
                }
                Either::Right((_, _)) => {
                    // Closed from our side; nothing left to watch.
                }
            }
        })
        .map_err(|err| PortalError::Failed(format!("Failed to spawn closed watcher: {err}")))
}

#[cfg(test)]
mod tests {
    use futures_channel::mpsc;
    use futures_util::FutureExt;

    use super::*;

    fn options(
        types: impl Into<Option<BitFlags<SourceType>>>,
        cursor: impl Into<Option<CursorMode>>,
    ) -> SelectSourcesOptions {
        SelectSourcesOptions::default()
            .set_types(types.into())
            .set_cursor_mode(cursor.into())
    }

    #[test]
    fn select_sources_validates_against_advertised() {
        let mut control = CaptureControl::new();
        let available = SourceType::Monitor | SourceType::Window;
        let cursors = CursorMode::Hidden | CursorMode::Embedded;

        control
            .configure(
                available,
                cursors,
                &options(SourceType::Monitor | SourceType::Window, CursorMode::Embedded),
            )
            .unwrap();
        assert!(control.config.selected);
        assert_eq!(control.config.cursor_mode, CursorMode::Embedded);

        // Virtual sources are not advertised.
        assert!(control
            .configure(
                available,
                cursors,
                &options(BitFlags::from(SourceType::Virtual), None),
            )
            .is_err());

        // Metadata cursors are not advertised.
        assert!(control
            .configure(available, cursors, &options(None, CursorMode::Metadata))
            .is_err());
    }

    #[test]
    fn select_sources_rejected_after_start() {
        let mut control = CaptureControl::new();
        let (tx, _rx) = mpsc::unbounded();
        control.begin_start(tx).unwrap();
        control.finish_start(true);

        assert!(matches!(
            control.configure(
                BitFlags::all(),
                BitFlags::all(),
                &options(BitFlags::from(SourceType::Monitor), None),
            ),
            Err(PortalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn second_concurrent_start_is_rejected() {
        let mut control = CaptureControl::new();
        let (tx, _rx) = mpsc::unbounded();
        control.begin_start(tx).unwrap();

        let (tx2, _rx2) = mpsc::unbounded();
        assert!(matches!(
            control.begin_start(tx2),
            Err(PortalError::Exist(_))
        ));

        // A cancelled start frees the session for a retry.
        control.finish_start(false);
        let (tx3, _rx3) = mpsc::unbounded();
        control.begin_start(tx3).unwrap();
    }

    #[test]
    fn start_rejected_once_active_or_closed() {
        let mut control = CaptureControl::new();
        let (tx, _rx) = mpsc::unbounded();
        control.begin_start(tx).unwrap();
        control.finish_start(true);

        let (tx2, _rx2) = mpsc::unbounded();
        assert!(matches!(
            control.begin_start(tx2),
            Err(PortalError::InvalidArgument(_))
        ));

        control.close();
        let (tx3, _rx3) = mpsc::unbounded();
        assert!(control.begin_start(tx3).is_err());
    }

    #[test]
    fn close_hands_out_conduits_once() {
        let mut control = CaptureControl::new();
        let (tx, mut rx) = mpsc::unbounded();
        let (guard_tx, mut guard_rx) = oneshot::channel::<()>();
        control.begin_start(tx).unwrap();
        control.watcher_guard = Some(guard_tx);

        let (active, guard) = control.close();
        if let Some(events) = active {
            let _ = events.unbounded_send(StartEvent::ClientClosed);
        }
        if let Some(guard) = guard {
            let _ = guard.send(());
        }
        assert!(matches!(
            rx.next().now_or_never().flatten(),
            Some(StartEvent::ClientClosed)
        ));
        assert!(guard_rx.try_recv().unwrap().is_some());

        // The second close, from the racing path, finds nothing to fire.
        let (active, guard) = control.close();
        assert!(active.is_none());
        assert!(guard.is_none());
    }

    #[test]
    fn device_validation() {
        assert!(validate_devices(BitFlags::all(), DeviceType::Keyboard | DeviceType::Pointer)
            .is_ok());
        assert!(validate_devices(
            BitFlags::from(DeviceType::Keyboard),
            DeviceType::Keyboard | DeviceType::Touchscreen,
        )
        .is_err());
    }
}
