//! The start coordination for capture sessions.
//!
//! A `Start` call suspends until the user consented, the compositor opened
//! every requested stream and each stream reported readiness: three
//! different asynchronous sources completing in arbitrary order, any of
//! which may be overtaken by the client withdrawing the request. All of
//! them funnel into one event sum type consumed by a single
//! [`StartCoordinator::dispatch`] function, which makes the two load-bearing
//! invariants mechanically checkable: the original invocation is completed
//! exactly once, and events arriving after the terminal state are ignored.

use std::sync::Arc;

use enumflags2::BitFlags;
use futures_channel::{mpsc::UnboundedReceiver, oneshot};
use futures_util::{
    future::{select, Either},
    pin_mut,
    stream::{BoxStream, StreamExt},
};

use crate::{
    compositor::{CompositorSession, StreamParameters},
    consent::{ConsentDialog, ConsentOutcome, ConsentRequest, SelectedSource, Selection},
    desktop::{
        remote_desktop::DeviceType,
        screencast::{CursorMode, SourceType, Stream, StreamBuilder},
    },
    PortalError,
};

/// Everything that can move a start forward, from any source.
#[derive(Debug)]
pub(crate) enum StartEvent {
    /// The consent dialog reported its terminal outcome.
    ConsentResolved(ConsentOutcome),
    /// Every stream-open call returned; readiness is now pending.
    StreamsOpened(Vec<OpenedStream>),
    /// One stream reported its PipeWire node id.
    StreamReady {
        /// Position of the stream in the opened set.
        index: usize,
        /// The backend-assigned node id.
        node_id: u32,
    },
    /// The client withdrew the request or closed the session.
    ClientClosed,
    /// A compositor call failed, synchronously or asynchronously.
    CollaboratorFailed(String),
}

/// The one side effect the state machine asks its driver to perform.
pub(crate) enum StartEffect {
    /// Start the compositor-side session and open a stream per selected
    /// source.
    OpenStreams(Selection),
}

/// One stream the compositor agreed to open, awaiting readiness.
#[derive(Debug, Clone)]
pub(crate) struct OpenedStream {
    pub source: SelectedSource,
    pub parameters: StreamParameters,
}

/// The terminal disposition of a start, exactly one per invocation.
#[derive(Debug)]
pub(crate) enum StartOutcome {
    /// Consent given and every stream ready; reply with code 0.
    Granted {
        streams: Vec<Stream>,
        devices: BitFlags<DeviceType>,
    },
    /// The user said no; reply with code 1.
    Declined,
    /// Cancelled, dismissed or failed; reply with code 2.
    Aborted,
}

/// The suspended original invocation.
///
/// Taking the sender is the at-most-once guard: every path that may
/// resolve the start goes through [`PendingStart::resolve`], and the first
/// one wins.
struct PendingStart(Option<oneshot::Sender<StartOutcome>>);

impl PendingStart {
    fn resolve(&mut self, outcome: StartOutcome) {
        match self.0.take() {
            Some(tx) => {
                // The receiver half may be gone if the method handler
                // itself went away; nothing left to answer then.
                let _ = tx.send(outcome);
            }
            None => {
                // Unreachable by construction: dispatch() checks the
                // terminal state before resolving.
                tracing::error!("start already resolved, dropping second completion");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartState {
    AwaitingConsent,
    OpeningStreams,
    AwaitingReadiness,
    Resolved,
    Cancelled,
}

/// Per-start bookkeeping of the requested streams and how many still owe a
/// readiness notification.
#[derive(Default)]
pub(crate) struct StreamSet {
    slots: Vec<StreamSlot>,
    pending: usize,
}

struct StreamSlot {
    source: SelectedSource,
    parameters: StreamParameters,
    node_id: Option<u32>,
}

impl StreamSet {
    fn begin(&mut self, opened: Vec<OpenedStream>) {
        self.slots = opened
            .into_iter()
            .map(|stream| StreamSlot {
                source: stream.source,
                parameters: stream.parameters,
                node_id: None,
            })
            .collect();
        self.pending = self.slots.len();
    }

    /// Record a readiness notification. Returns `true` only for the
    /// notification that completes the set; duplicates and unknown
    /// indices never decrement the count below zero.
    fn mark_ready(&mut self, index: usize, node_id: u32) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            tracing::warn!("readiness for unknown stream index {index}");
            return false;
        };
        if slot.node_id.is_some() {
            tracing::warn!("duplicate readiness for stream {index}, ignoring");
            return false;
        }
        slot.node_id = Some(node_id);
        self.pending -= 1;
        self.pending == 0
    }

    fn all_ready(&self) -> bool {
        self.pending == 0
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending
    }

    fn to_streams(&self) -> Vec<Stream> {
        self.slots
            .iter()
            .map(|slot| {
                let source_type = match slot.source {
                    SelectedSource::Monitor { .. } => SourceType::Monitor,
                    SelectedSource::Window { .. } => SourceType::Window,
                };
                StreamBuilder::new(slot.node_id.unwrap_or_default())
                    .position(slot.parameters.position)
                    .size(slot.parameters.size)
                    .source_type(source_type)
                    .build()
            })
            .collect()
    }
}

/// The state machine tying consent, stream fan-out and readiness together
/// into the single deferred reply of a `Start` call.
pub(crate) struct StartCoordinator {
    state: StartState,
    request: ConsentRequest,
    streams: StreamSet,
    devices: BitFlags<DeviceType>,
    reply: PendingStart,
}

impl StartCoordinator {
    pub fn new(reply: oneshot::Sender<StartOutcome>, request: ConsentRequest) -> Self {
        Self {
            state: StartState::AwaitingConsent,
            request,
            streams: StreamSet::default(),
            devices: BitFlags::empty(),
            reply: PendingStart(Some(reply)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StartState::Resolved | StartState::Cancelled)
    }

    /// Feed one event through the machine; the returned effect, if any, is
    /// for the driver to perform.
    pub fn dispatch(&mut self, event: StartEvent) -> Option<StartEffect> {
        if self.is_terminal() {
            tracing::debug!("start settled, ignoring late event {event:?}");
            return None;
        }
        match (self.state, event) {
            (StartState::AwaitingConsent, StartEvent::ConsentResolved(outcome)) => match outcome {
                ConsentOutcome::Accepted(selection) => {
                    if let Err(reason) = validate_selection(&self.request, &selection) {
                        tracing::warn!("rejecting dialog selection: {reason}");
                        self.resolve(StartOutcome::Aborted);
                        return None;
                    }
                    self.devices = selection.devices;
                    self.state = StartState::OpeningStreams;
                    Some(StartEffect::OpenStreams(selection))
                }
                ConsentOutcome::Declined => {
                    self.resolve(StartOutcome::Declined);
                    None
                }
                ConsentOutcome::Dismissed => {
                    self.resolve(StartOutcome::Aborted);
                    None
                }
            },
            (StartState::OpeningStreams, StartEvent::StreamsOpened(opened)) => {
                self.streams.begin(opened);
                if self.streams.all_ready() {
                    // A start with no streams (device-only sharing) has
                    // nothing to wait for.
                    self.resolve_granted();
                } else {
                    self.state = StartState::AwaitingReadiness;
                }
                None
            }
            (StartState::AwaitingReadiness, StartEvent::StreamReady { index, node_id }) => {
                if self.streams.mark_ready(index, node_id) {
                    self.resolve_granted();
                }
                None
            }
            (_, StartEvent::ClientClosed) => {
                self.resolve(StartOutcome::Aborted);
                None
            }
            (_, StartEvent::CollaboratorFailed(reason)) => {
                tracing::warn!("start aborted by collaborator failure: {reason}");
                self.resolve(StartOutcome::Aborted);
                None
            }
            (state, event) => {
                tracing::debug!("ignoring out-of-order event {event:?} in {state:?}");
                None
            }
        }
    }

    fn resolve(&mut self, outcome: StartOutcome) {
        self.state = match outcome {
            StartOutcome::Granted { .. } => StartState::Resolved,
            _ => StartState::Cancelled,
        };
        self.reply.resolve(outcome);
    }

    fn resolve_granted(&mut self) {
        let streams = self.streams.to_streams();
        let devices = self.devices;
        self.resolve(StartOutcome::Granted { streams, devices });
    }
}

/// A dialog may only hand back what the request offered.
fn validate_selection(request: &ConsentRequest, selection: &Selection) -> Result<(), String> {
    if !request.multiple && selection.sources.len() > 1 {
        return Err(format!(
            "{} sources selected on a single-source request",
            selection.sources.len()
        ));
    }
    for source in &selection.sources {
        let kind = match source {
            SelectedSource::Monitor { .. } => SourceType::Monitor,
            SelectedSource::Window { .. } => SourceType::Window,
        };
        if !request.source_types.contains(kind) {
            return Err(format!("{kind:?} sources were not requested"));
        }
    }
    if !request.device_types.contains(selection.devices) {
        return Err(format!(
            "devices {} exceed the requested set",
            selection.devices.bits()
        ));
    }
    Ok(())
}

/// Drive one start to its terminal state.
///
/// The driver owns the coordinator and multiplexes, on a single task, the
/// dialog future, the stream-opening future, the merged readiness signal
/// streams and the control channel carrying client cancellation. Every
/// completion funnels through `dispatch`, so the at-most-once reply does
/// not depend on scheduling. Dropping an in-flight compositor call on
/// cancellation is safe: its eventual completion has nobody to notify and
/// the session-level `Stop` on close cleans up whatever was already
/// opened.
pub(crate) async fn run_start(
    mut coordinator: StartCoordinator,
    mut control: UnboundedReceiver<StartEvent>,
    consent: Arc<dyn ConsentDialog>,
    consent_request: ConsentRequest,
    session: CompositorSession,
    cursor_mode: CursorMode,
) {
    // Await consent, letting cancellation through. Dropping the dialog
    // future is what dismisses the dialog; the cancellation itself already
    // went through the machine as an explicit event.
    let dialog = consent.present(consent_request);
    pin_mut!(dialog);
    let selection = loop {
        let next = control.next();
        pin_mut!(next);
        match select(&mut dialog, next).await {
            Either::Left((outcome, _)) => {
                match coordinator.dispatch(StartEvent::ConsentResolved(outcome)) {
                    Some(StartEffect::OpenStreams(selection)) => break selection,
                    None => return,
                }
            }
            Either::Right((event, _)) => {
                coordinator.dispatch(event.unwrap_or(StartEvent::ClientClosed));
                if coordinator.is_terminal() {
                    return;
                }
            }
        }
    };

    // Start the compositor session and open one stream per source,
    // still letting cancellation through.
    let (opened, listeners) = {
        let opening = open_streams(&session, &selection, cursor_mode);
        pin_mut!(opening);
        loop {
            let next = control.next();
            pin_mut!(next);
            match select(&mut opening, next).await {
                Either::Left((Ok(result), _)) => break result,
                Either::Left((Err(err), _)) => {
                    coordinator.dispatch(StartEvent::CollaboratorFailed(err.to_string()));
                    return;
                }
                Either::Right((event, _)) => {
                    coordinator.dispatch(event.unwrap_or(StartEvent::ClientClosed));
                    if coordinator.is_terminal() {
                        return;
                    }
                }
            }
        }
    };

    coordinator.dispatch(StartEvent::StreamsOpened(opened));
    if coordinator.is_terminal() {
        // Device-only start, resolved without waiting.
        return;
    }

    // Count readiness notifications down to zero.
    let mut readiness = futures_util::stream::select_all(listeners);
    while !coordinator.is_terminal() {
        let event = {
            let ready = readiness.next();
            let ctrl = control.next();
            pin_mut!(ready, ctrl);
            match select(ready, ctrl).await {
                Either::Left((Some(event), _)) => event,
                Either::Left((None, _)) => StartEvent::CollaboratorFailed(
                    "stream notification source closed".to_string(),
                ),
                Either::Right((event, _)) => event.unwrap_or(StartEvent::ClientClosed),
            }
        };
        coordinator.dispatch(event);
    }
}

async fn open_streams(
    session: &CompositorSession,
    selection: &Selection,
    cursor_mode: CursorMode,
) -> Result<(Vec<OpenedStream>, Vec<BoxStream<'static, StartEvent>>), PortalError> {
    session.start().await?;

    let cursor_mode = BitFlags::from(cursor_mode).bits();
    let mut opened = Vec::with_capacity(selection.sources.len());
    let mut listeners = Vec::with_capacity(selection.sources.len());
    for (index, source) in selection.sources.iter().enumerate() {
        let stream = match source {
            SelectedSource::Monitor { connector } => {
                session.record_monitor(connector, cursor_mode).await?
            }
            SelectedSource::Window { id } => session.record_window(*id, cursor_mode).await?,
        };
        // Subscribe before opening the next stream so no notification can
        // slip past; they arrive in arbitrary order.
        let added = stream.receive_stream_added().await?;
        listeners.push(
            added
                .map(move |node_id| StartEvent::StreamReady { index, node_id })
                .boxed(),
        );
        let parameters = stream.parameters().await;
        opened.push(OpenedStream {
            source: source.clone(),
            parameters,
        });
    }
    Ok((opened, listeners))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    use super::*;

    fn monitor(connector: &str) -> SelectedSource {
        SelectedSource::Monitor {
            connector: connector.to_string(),
        }
    }

    fn opened(source: SelectedSource) -> OpenedStream {
        OpenedStream {
            source,
            parameters: StreamParameters {
                position: Some((0, 0)),
                size: Some((1920, 1080)),
            },
        }
    }

    fn accepted(sources: Vec<SelectedSource>) -> StartEvent {
        StartEvent::ConsentResolved(ConsentOutcome::Accepted(Selection {
            sources,
            devices: BitFlags::empty(),
        }))
    }

    fn consent_request() -> ConsentRequest {
        ConsentRequest {
            app_id: None,
            parent_window: None,
            source_types: SourceType::Monitor | SourceType::Window,
            device_types: BitFlags::all(),
            multiple: true,
            cursor_mode: CursorMode::Embedded,
        }
    }

    fn coordinator() -> (StartCoordinator, oneshot::Receiver<StartOutcome>) {
        let (tx, rx) = oneshot::channel();
        (StartCoordinator::new(tx, consent_request()), rx)
    }

    fn outcome_of(rx: &mut oneshot::Receiver<StartOutcome>) -> Option<StartOutcome> {
        rx.try_recv().ok().flatten()
    }

    #[test]
    fn two_monitors_resolve_once_both_ready() {
        let (mut coordinator, mut rx) = coordinator();

        let effect = coordinator.dispatch(accepted(vec![monitor("DP-1"), monitor("DP-2")]));
        assert!(matches!(effect, Some(StartEffect::OpenStreams(_))));

        coordinator.dispatch(StartEvent::StreamsOpened(vec![
            opened(monitor("DP-1")),
            opened(monitor("DP-2")),
        ]));
        assert!(!coordinator.is_terminal());

        // Readiness arrives in arbitrary order.
        coordinator.dispatch(StartEvent::StreamReady {
            index: 1,
            node_id: 77,
        });
        assert!(!coordinator.is_terminal());

        coordinator.dispatch(StartEvent::StreamReady {
            index: 0,
            node_id: 42,
        });
        assert!(coordinator.is_terminal());

        match outcome_of(&mut rx) {
            Some(StartOutcome::Granted { streams, .. }) => {
                assert_eq!(streams.len(), 2);
                let ids: Vec<u32> = streams.iter().map(Stream::pipe_wire_node_id).collect();
                assert_eq!(ids, vec![42, 77]);
                assert_eq!(streams[0].source_type(), Some(SourceType::Monitor));
                assert_eq!(streams[0].size(), Some((1920, 1080)));
            }
            other => panic!("expected a granted start, got {other:?}"),
        }
    }

    #[test]
    fn declined_and_dismissed_map_to_distinct_outcomes() {
        let (mut coordinator, mut rx) = coordinator();
        coordinator.dispatch(StartEvent::ConsentResolved(ConsentOutcome::Declined));
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Declined)));

        let (mut coordinator, mut rx) = self::coordinator();
        coordinator.dispatch(StartEvent::ConsentResolved(ConsentOutcome::Dismissed));
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Aborted)));
    }

    #[test]
    fn zero_stream_start_resolves_immediately() {
        let (mut coordinator, mut rx) = coordinator();
        coordinator.dispatch(StartEvent::ConsentResolved(ConsentOutcome::Accepted(
            Selection {
                sources: Vec::new(),
                devices: DeviceType::Keyboard | DeviceType::Pointer,
            },
        )));
        assert!(!coordinator.is_terminal());

        // No streams requested: the "reached zero" trigger still fires.
        coordinator.dispatch(StartEvent::StreamsOpened(Vec::new()));
        assert!(coordinator.is_terminal());
        match outcome_of(&mut rx) {
            Some(StartOutcome::Granted { streams, devices }) => {
                assert!(streams.is_empty());
                assert_eq!(devices, DeviceType::Keyboard | DeviceType::Pointer);
            }
            other => panic!("expected a granted start, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_readiness_never_double_completes() {
        let (mut coordinator, mut rx) = coordinator();
        coordinator.dispatch(accepted(vec![monitor("DP-1"), monitor("DP-2")]));
        coordinator.dispatch(StartEvent::StreamsOpened(vec![
            opened(monitor("DP-1")),
            opened(monitor("DP-2")),
        ]));

        coordinator.dispatch(StartEvent::StreamReady {
            index: 0,
            node_id: 42,
        });
        // A duplicate signal for the same stream must not decrement.
        coordinator.dispatch(StartEvent::StreamReady {
            index: 0,
            node_id: 42,
        });
        assert_eq!(coordinator.streams.pending(), 1);
        assert!(!coordinator.is_terminal());

        coordinator.dispatch(StartEvent::StreamReady {
            index: 1,
            node_id: 77,
        });
        assert!(coordinator.is_terminal());
        assert!(matches!(
            outcome_of(&mut rx),
            Some(StartOutcome::Granted { .. })
        ));

        // Extra notifications beyond the expected count are no-ops.
        coordinator.dispatch(StartEvent::StreamReady {
            index: 1,
            node_id: 77,
        });
        assert_eq!(coordinator.streams.pending(), 0);
    }

    #[test]
    fn close_during_readiness_wait_wins_once() {
        let (mut coordinator, mut rx) = coordinator();
        coordinator.dispatch(accepted(vec![monitor("DP-1"), monitor("DP-2")]));
        coordinator.dispatch(StartEvent::StreamsOpened(vec![
            opened(monitor("DP-1")),
            opened(monitor("DP-2")),
        ]));
        coordinator.dispatch(StartEvent::StreamReady {
            index: 0,
            node_id: 42,
        });

        coordinator.dispatch(StartEvent::ClientClosed);
        assert!(coordinator.is_terminal());
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Aborted)));

        // The second readiness notification arrives after the fact and
        // must be a no-op, not a second reply.
        let effect = coordinator.dispatch(StartEvent::StreamReady {
            index: 1,
            node_id: 77,
        });
        assert!(effect.is_none());
        assert!(outcome_of(&mut rx).is_none());
    }

    #[test]
    fn close_tears_down_every_phase() {
        // Before consent.
        let (mut coordinator, mut rx) = coordinator();
        coordinator.dispatch(StartEvent::ClientClosed);
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Aborted)));
        // The dialog outcome arriving afterwards is ignored.
        assert!(coordinator.dispatch(accepted(vec![monitor("DP-1")])).is_none());

        // While opening streams.
        let (mut coordinator, mut rx) = self::coordinator();
        coordinator.dispatch(accepted(vec![monitor("DP-1")]));
        coordinator.dispatch(StartEvent::ClientClosed);
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Aborted)));
        assert!(coordinator
            .dispatch(StartEvent::StreamsOpened(vec![opened(monitor("DP-1"))]))
            .is_none());
    }

    #[test]
    fn selection_exceeding_the_request_is_rejected() {
        let (tx, mut rx) = oneshot::channel();
        let request = ConsentRequest {
            multiple: false,
            source_types: SourceType::Monitor.into(),
            device_types: BitFlags::empty(),
            ..consent_request()
        };
        let mut coordinator = StartCoordinator::new(tx, request);

        // A buggy dialog hands back two sources on a single-source
        // request; nothing is opened and the start fails.
        let effect = coordinator.dispatch(accepted(vec![monitor("DP-1"), monitor("DP-2")]));
        assert!(effect.is_none());
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Aborted)));
    }

    #[test]
    fn collaborator_failure_aborts_without_partial_success() {
        let (mut coordinator, mut rx) = coordinator();
        coordinator.dispatch(accepted(vec![monitor("DP-1"), monitor("HDMI-1")]));
        // One RecordMonitor failed; the whole start fails.
        coordinator.dispatch(StartEvent::CollaboratorFailed(
            "invalid connector `HDMI-1`".to_string(),
        ));
        assert!(coordinator.is_terminal());
        assert!(matches!(outcome_of(&mut rx), Some(StartOutcome::Aborted)));
    }

    #[test]
    fn random_interleavings_yield_exactly_one_reply() {
        let mut rng = StdRng::seed_from_u64(0x5747_2653);
        for _ in 0..200 {
            let streams = rng.gen_range(1..=4usize);
            let (mut coordinator, mut rx) = coordinator();
            coordinator.dispatch(accepted(
                (0..streams).map(|i| monitor(&format!("DP-{i}"))).collect(),
            ));
            coordinator.dispatch(StartEvent::StreamsOpened(
                (0..streams)
                    .map(|i| opened(monitor(&format!("DP-{i}"))))
                    .collect(),
            ));

            // Readiness events, some duplicated, with an optional close
            // spliced in anywhere.
            let mut events: Vec<StartEvent> = (0..streams)
                .map(|index| StartEvent::StreamReady {
                    index,
                    node_id: 100 + index as u32,
                })
                .collect();
            if rng.gen_bool(0.3) {
                let dup = rng.gen_range(0..streams);
                events.push(StartEvent::StreamReady {
                    index: dup,
                    node_id: 100 + dup as u32,
                });
            }
            let close_at = rng
                .gen_bool(0.5)
                .then(|| rng.gen_range(0..=events.len()));
            events.shuffle(&mut rng);
            if let Some(at) = close_at {
                events.insert(at, StartEvent::ClientClosed);
            }

            for event in events {
                coordinator.dispatch(event);
            }

            // Exactly one terminal reply, whatever the interleaving.
            assert!(coordinator.is_terminal());
            let first = outcome_of(&mut rx);
            assert!(first.is_some());
            match (close_at, first.unwrap()) {
                (None, StartOutcome::Granted { streams: granted, .. }) => {
                    assert_eq!(granted.len(), streams)
                }
                (None, other) => panic!("expected a grant, got {other:?}"),
                (Some(_), _) => {
                    // With a close in the mix either disposition may win,
                    // but never a second one.
                }
            }
            assert!(outcome_of(&mut rx).is_none());
        }
    }
}
