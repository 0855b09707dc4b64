//! Server engine: pull loop, stream dispatch, per-stream bookkeeping.
//!
//! The server runs a protocol-level state machine (`INIT -> READY ->
//! STOPPED`). Stream events reflected off the wire all loop `READY -> READY`;
//! first packets carry the dispatch action that instantiates a registered
//! handler's machine, continuations carry the action that advances it. A
//! stream's table entry lives until its machine's last observed state is
//! terminal, because the handler may still need to emit response parts
//! asynchronously.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::fsm::{Event, EventQueue, StateMachine, TraceFn, Transition};
use crate::transport::{Params, Record};
use crate::wire::{self, StreamEvent};

use super::{set_stream_event_names, Gateway, StateSet, StreamInfo, StreamPart};
use super::{EV_END, EV_ERROR, EV_FIX, EV_NEXT, EV_ONE, EV_START, EV_STOP};

// Protocol-level states.
pub const ST_INIT: u16 = 0;
pub const ST_READY: u16 = 1;
pub const ST_STOPPED: u16 = 2;

// Server-only events; the stream events occupy 1..=7.
pub const EV_START_SERVER: Event = 300;
pub const EV_STOP_SERVER: Event = 301;
pub const EV_STREAM_INIT_FAILED: Event = 303;
pub const EV_BAD_MESSAGE: Event = 304;

/// Builds a fresh state machine for one incoming stream, given its first
/// packet and the server's trace callback.
pub type StreamFsmFactory = Box<dyn Fn(&StreamPart, TraceFn) -> StateMachine<ServerCore> + Send>;

/// Builds the cursor record for one incoming stream, given its assigned id.
pub type StreamInfoFactory = Box<dyn Fn(u64) -> StreamInfo + Send>;

struct Handler {
    fsm_factory: StreamFsmFactory,
    terminal_states: StateSet,
    info_factory: StreamInfoFactory,
}

struct StreamEntry {
    fsm: StateMachine<ServerCore>,
    terminal_states: StateSet,
    info: StreamInfo,
    last_state: u16,
    stream_type: u8,
}

// =============================================================================
// Server core
// =============================================================================

/// Mutable server state threaded through the protocol machine and every
/// per-stream machine as their action context.
pub struct ServerCore {
    handlers: Vec<Option<Handler>>,
    streams: HashMap<u64, StreamEntry>,
    act_message: StreamPart,
    trace: TraceFn,
}

impl ServerCore {
    fn new(trace: TraceFn) -> Self {
        Self {
            handlers: (0..256).map(|_| None).collect(),
            streams: HashMap::new(),
            act_message: StreamPart::default(),
            trace,
        }
    }

    /// The record currently being processed; valid inside actions.
    pub fn current_part(&self) -> &StreamPart {
        &self.act_message
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn has_stream(&self, id: u64) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn stream_info(&self, id: u64) -> Option<&StreamInfo> {
        self.streams.get(&id).map(|entry| &entry.info)
    }

    pub fn stream_type(&self, id: u64) -> Option<u8> {
        self.streams.get(&id).map(|entry| entry.stream_type)
    }

    /// Enqueue `event` on the private machine of stream `id`.
    ///
    /// With `if_empty` the event is only queued when the machine has nothing
    /// pending. Fails when `id` is absent from the stream table: the stream
    /// never existed or already completed.
    pub fn push_event(&mut self, id: u64, event: Event, if_empty: bool) -> Result<()> {
        match self.streams.get_mut(&id) {
            Some(entry) => {
                if if_empty {
                    entry.fsm.enqueue_if_empty(event);
                } else {
                    entry.fsm.enqueue(event);
                }
                Ok(())
            }
            None => Err(GatewayError::UnknownStream(id)),
        }
    }

    /// First-packet action: look up the handler for the stream type, build
    /// the stream's machine and info, advance it once, and retain the entry
    /// only while it has not reached a terminal state.
    fn dispatch_stream(&mut self, queue: &mut EventQueue) -> Result<()> {
        let stream_type = self.act_message.stream_type;
        let (mut fsm, terminal_states, mut info) =
            match self.handlers.get(stream_type as usize).and_then(Option::as_ref) {
                Some(handler) => {
                    let fsm = (handler.fsm_factory)(&self.act_message, self.trace.clone());
                    let info = (handler.info_factory)(self.act_message.id);
                    (fsm, handler.terminal_states.clone(), info)
                }
                None => {
                    queue.enqueue(EV_STREAM_INIT_FAILED);
                    return Err(GatewayError::StreamInitFailed(stream_type));
                }
            };

        info.received_seqno = self.act_message.seqno as i64;
        info.received_pos = self.act_message.position;

        fsm.enqueue(self.act_message.event as Event);
        let last_state = fsm.run(ST_INIT, self)?;

        if terminal_states.contains(&last_state) {
            // fire-and-forget: nothing left for this stream to do
            debug!(
                id = self.act_message.id,
                stream_type,
                state = last_state,
                "stream completed at dispatch"
            );
        } else {
            let id = self.act_message.id;
            self.streams.insert(
                id,
                StreamEntry {
                    fsm,
                    terminal_states,
                    info,
                    last_state,
                    stream_type,
                },
            );
            debug!(id, stream_type, state = last_state, "stream retained");
        }
        Ok(())
    }

    /// Continuation action: advance the owning stream's machine by the
    /// arrived event and drop the entry once it reaches a terminal state.
    ///
    /// Parts for an id absent from the table (a fire-and-forget stream, or
    /// one that already completed) are observed and ignored; sequence numbers
    /// may arrive out of order, reassembly is the handler machine's business.
    fn advance_stream(&mut self) -> Result<()> {
        let id = self.act_message.id;
        let event = self.act_message.event as Event;

        let Some(mut entry) = self.streams.remove(&id) else {
            debug!(id, event, "part for unknown stream ignored");
            return Ok(());
        };

        entry.info.received_seqno = self.act_message.seqno as i64;
        entry.info.received_pos = self.act_message.position;

        entry.fsm.enqueue(event);
        entry.last_state = entry.fsm.run(entry.last_state, self)?;

        if entry.terminal_states.contains(&entry.last_state) {
            debug!(id, state = entry.last_state, "stream completed");
        } else {
            self.streams.insert(id, entry);
        }
        Ok(())
    }
}

// =============================================================================
// Server
// =============================================================================

/// Cloneable handle that requests a cooperative stop of [`Server::run`];
/// takes effect at the next pull-timeout boundary.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Receiving side of a gateway pair.
pub struct Server {
    gateway: Gateway,
    core: ServerCore,
    fsm: StateMachine<ServerCore>,
    last_state: u16,
    stopped: Arc<AtomicBool>,
    pull_timeout: Duration,
}

impl Server {
    pub fn create(base_path: &Path, params: &Params, trace: TraceFn) -> Result<Self> {
        let gateway = Gateway::new(base_path, "1", "0", params)?;
        let fsm = build_protocol_fsm(base_path, trace.clone());

        Ok(Self {
            gateway,
            core: ServerCore::new(trace),
            fsm,
            last_state: ST_INIT,
            stopped: Arc::new(AtomicBool::new(false)),
            pull_timeout: params.pull_timeout(),
        })
    }

    /// Register the handler bundle for `stream_type`; the last registration
    /// for a type wins. Streams whose machine never reaches one of
    /// `terminal_states` keep their table entry for the life of the server,
    /// so handler machines must terminate.
    pub fn add_handler<F, I>(
        &mut self,
        stream_type: u8,
        fsm_factory: F,
        terminal_states: StateSet,
        info_factory: I,
    ) where
        F: Fn(&StreamPart, TraceFn) -> StateMachine<ServerCore> + Send + 'static,
        I: Fn(u64) -> StreamInfo + Send + 'static,
    {
        self.core.handlers[stream_type as usize] = Some(Handler {
            fsm_factory: Box::new(fsm_factory),
            terminal_states,
            info_factory: Box::new(info_factory),
        });
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stopped.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Last observed protocol-level state.
    pub fn state(&self) -> u16 {
        self.last_state
    }

    pub fn stream_count(&self) -> usize {
        self.core.stream_count()
    }

    pub fn has_stream(&self, id: u64) -> bool {
        self.core.has_stream(id)
    }

    pub fn stream_info(&self, id: u64) -> Option<&StreamInfo> {
        self.core.stream_info(id)
    }

    /// See [`ServerCore::push_event`].
    pub fn push_event(&mut self, id: u64, event: Event, if_empty: bool) -> Result<()> {
        self.core.push_event(id, event, if_empty)
    }

    pub fn sender_position(&self) -> u64 {
        self.gateway.sender_position()
    }

    pub fn receiver_position(&self) -> u64 {
        self.gateway.receiver_position()
    }

    pub fn seek_to_end(&self) -> u64 {
        self.gateway.seek_to_end()
    }

    /// Pull and process inbound records starting at `from` until stopped.
    ///
    /// Blocks the calling thread; one record at a time is decoded into the
    /// scratch part, turned into a protocol event, and run through the
    /// machine. Decode and dispatch failures are logged and reported as
    /// `BAD_MESSAGE`/`STREAM_INIT_FAILED` events, never aborting the loop.
    pub fn run(&mut self, mut from: u64) -> Result<()> {
        self.fsm.enqueue(EV_START_SERVER);
        self.last_state = self.fsm.run(self.last_state, &mut self.core)?;
        debug!(from, "server running");

        while !self.is_stopped() {
            let Self {
                gateway,
                core,
                fsm,
                last_state,
                stopped,
                pull_timeout,
            } = self;
            from = gateway.pull(
                from,
                &mut |record| {
                    if let Err(e) = process_record(core, fsm, last_state, &record) {
                        warn!(
                            position = record.position,
                            error = %e,
                            "record processing failed; loop continues"
                        );
                        // the failing action may have reported a protocol
                        // event; drain it so the failure is observable now
                        match fsm.run(*last_state, core) {
                            Ok(state) => *last_state = state,
                            Err(e) => warn!(error = %e, "failure event run failed"),
                        }
                    }
                    !stopped.load(Ordering::Acquire)
                },
                *pull_timeout,
            )?;
        }

        self.fsm.enqueue(EV_STOP_SERVER);
        self.last_state = self.fsm.run(self.last_state, &mut self.core)?;
        debug!(state = self.last_state, "server stopped");
        Ok(())
    }
}

/// Decode one record, feed its event to the protocol machine, advance.
fn process_record(
    core: &mut ServerCore,
    fsm: &mut StateMachine<ServerCore>,
    last_state: &mut u16,
    record: &Record,
) -> Result<()> {
    match wire::decode_record(record.position, &record.data) {
        Ok(part) => {
            core.act_message = part;
            fsm.enqueue(core.act_message.event as Event);
        }
        Err(e) => {
            // a first packet that cannot be parsed is an init failure,
            // everything else malformed is a bad message
            let event = match record.data.first().copied().and_then(StreamEvent::from_u8) {
                Some(StreamEvent::Start) | Some(StreamEvent::One) => EV_STREAM_INIT_FAILED,
                _ => EV_BAD_MESSAGE,
            };
            warn!(position = record.position, error = %e, event, "undecodable record");
            fsm.enqueue(event);
        }
    }
    *last_state = fsm.run(*last_state, core)?;
    Ok(())
}

fn build_protocol_fsm(base_path: &Path, trace: TraceFn) -> StateMachine<ServerCore> {
    let mut fsm = StateMachine::new(format!("SERVER:{}", base_path.display()), trace);

    fsm.state_name(ST_INIT, "INIT");
    fsm.state_name(ST_READY, "READY");
    fsm.state_name(ST_STOPPED, "STOPPED");

    set_stream_event_names(&mut fsm);
    fsm.event_name(EV_START_SERVER, "START SERVER");
    fsm.event_name(EV_STOP_SERVER, "STOP SERVER");
    fsm.event_name(EV_STREAM_INIT_FAILED, "STREAM INIT ERROR");
    fsm.event_name(EV_BAD_MESSAGE, "BAD MESSAGE");

    fsm.add_transition(Transition::new(ST_INIT, EV_START_SERVER, ST_READY, "Start server"));
    fsm.add_transition(Transition::new(ST_READY, EV_STOP_SERVER, ST_STOPPED, "Stop server"));
    fsm.add_transition(Transition::new(
        ST_READY,
        EV_STREAM_INIT_FAILED,
        ST_READY,
        "Cannot initialize stream",
    ));
    fsm.add_transition(Transition::new(
        ST_READY,
        EV_BAD_MESSAGE,
        ST_READY,
        "Bad stream part arrived",
    ));

    // stream events never change the server-level state; first packets
    // dispatch, everything else advances the owning stream
    fsm.add_transition(
        Transition::new(ST_READY, EV_START, ST_READY, "Start client stream").with_action(
            1,
            "INIT STREAM",
            |core: &mut ServerCore, _seqno, _info, queue| core.dispatch_stream(queue),
        ),
    );
    fsm.add_transition(
        Transition::new(ST_READY, EV_ONE, ST_READY, "Single client message").with_action(
            1,
            "INIT STREAM",
            |core: &mut ServerCore, _seqno, _info, queue| core.dispatch_stream(queue),
        ),
    );

    let continuations = [
        (EV_NEXT, "Next in client stream"),
        (EV_END, "End client stream"),
        (EV_STOP, "Client requests stop server stream"),
        (EV_FIX, "Client requests missing piece of server stream"),
        (EV_ERROR, "Client says ERROR"),
    ];
    for (event, description) in continuations {
        fsm.add_transition(
            Transition::new(ST_READY, event, ST_READY, description).with_action(
                1,
                "ADVANCE STREAM",
                |core: &mut ServerCore, _seqno, _info, _queue| core.advance_stream(),
            ),
        );
    }

    fsm
}
