//! End-to-end gateway scenarios: a client and a server attached to the same
//! base path, the server pulling on a background thread.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tempfile::TempDir;

use streamgate::fsm::{no_trace, EventQueue, StateMachine, TraceFn, Transition, TransitionInfo};
use streamgate::gateway::server::ST_STOPPED;
use streamgate::gateway::{set_stream_event_names, EV_END, EV_NEXT, EV_ONE, EV_START, EV_STOP};
use streamgate::{transport, wire};
use streamgate::{Client, Params, Publisher, Server, ServerCore, StateSet, StreamInfo, Subscriber};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn base_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("gw")
}

/// Server thread helper: run until stopped, hand the server back for
/// post-mortem assertions.
fn spawn_server(mut server: Server) -> thread::JoinHandle<streamgate::Result<Server>> {
    thread::spawn(move || {
        let from = server.receiver_position();
        server.run(from)?;
        Ok(server)
    })
}

/// Client-side machine that terminates as soon as its single packet is out.
fn single_shot_client() -> (StateMachine<()>, StateSet) {
    (StateMachine::new("client", no_trace()), StateSet::from([0]))
}

#[test]
fn test_create_only() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let _server = Server::create(&base_path(&tmp), &params, no_trace())?;
    let _client = Client::create(&base_path(&tmp), &params)?;
    Ok(())
}

#[test]
fn test_single_packet_framing() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();
    let client = Client::create(&base_path(&tmp), &params)?;

    let expected_id = client.sender_position();
    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        1,
        |part| {
            part.buffer = Bytes::from_static(b"Hello world");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;

    assert_eq!(info.id, expected_id as i64);
    assert_eq!(info.sent_seqno, 0);

    // read the raw channel the client wrote
    let subscriber = transport::open_subscriber(&base_path(&tmp).join("0"), &params);
    let mut frames = Vec::new();
    subscriber.pull(
        0,
        &mut |record| {
            frames.push(wire::decode_record(record.position, &record.data).unwrap());
            true
        },
        Duration::from_millis(10),
    )?;

    assert_eq!(frames.len(), 1);
    let part = &frames[0];
    assert_eq!(part.event, EV_ONE as u8);
    assert_eq!(part.stream_type, 1);
    assert_eq!(part.id, expected_id);
    assert_eq!(part.position, expected_id);
    assert_eq!(part.buffer.as_ref(), b"Hello world");
    Ok(())
}

#[test]
fn test_multi_packet_framing() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();
    let client = Client::create(&base_path(&tmp), &params)?;

    let mut fsm: StateMachine<()> = StateMachine::new("client", no_trace());
    set_stream_event_names(&mut fsm);
    fsm.add_transition(Transition::new(0, EV_START, 0, "stream opened"));
    fsm.add_transition(Transition::new(0, EV_NEXT, 0, "part sent"));
    fsm.add_transition(Transition::new(0, EV_END, 1, "stream closed"));

    let chunks: [&[u8]; 4] = [b"spl", b"it ", b"mess", b"age"];
    let mut next = 0usize;
    let expected_id = client.sender_position();
    let mut info = StreamInfo::new();
    client.start(
        3,
        |part| {
            part.buffer = Bytes::copy_from_slice(chunks[next]);
            next += 1;
            next < chunks.len()
        },
        &mut fsm,
        &mut (),
        &StateSet::from([1]),
        &mut info,
    )?;

    assert_eq!(info.sent_seqno, 3);

    let subscriber = transport::open_subscriber(&base_path(&tmp).join("0"), &params);
    let mut frames = Vec::new();
    subscriber.pull(
        0,
        &mut |record| {
            frames.push(wire::decode_record(record.position, &record.data).unwrap());
            true
        },
        Duration::from_millis(10),
    )?;

    let events: Vec<u8> = frames.iter().map(|p| p.event).collect();
    assert_eq!(
        events,
        vec![EV_START as u8, EV_NEXT as u8, EV_NEXT as u8, EV_END as u8]
    );
    assert!(frames.iter().all(|p| p.id == expected_id));
    let seqnos: Vec<u64> = frames.iter().skip(1).map(|p| p.seqno).collect();
    assert_eq!(seqnos, vec![1, 2, 3]);
    let payload: Vec<u8> = frames.iter().flat_map(|p| p.buffer.to_vec()).collect();
    assert_eq!(payload, b"split message");
    Ok(())
}

#[test]
fn test_push_single_fire_and_forget() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let mut server = Server::create(&base_path(&tmp), &params, no_trace())?;
    server.seek_to_end();

    let (id_tx, id_rx) = mpsc::channel();
    let (msg_tx, msg_rx) = mpsc::channel();
    server.add_handler(
        1,
        move |part, trace| {
            let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
            fsm.state_name(0, "INIT");
            fsm.state_name(1, "DONE");
            set_stream_event_names(&mut fsm);
            let tx = msg_tx.clone();
            fsm.add_transition(
                Transition::new(0, EV_ONE, 1, "Single message").with_action(
                    1,
                    "DELIVER",
                    move |core: &mut ServerCore, _seqno, _info, _queue| {
                        tx.send(core.current_part().buffer.clone()).ok();
                        Ok(())
                    },
                ),
            );
            fsm
        },
        StateSet::from([1]),
        move |id| {
            id_tx.send(id).ok();
            StreamInfo::with_id(id)
        },
    );

    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    let client = Client::create(&base_path(&tmp), &params)?;
    client.seek_to_end();

    let expected_id = client.sender_position();
    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        1,
        |part| {
            part.buffer = Bytes::from_static(b"Hello world");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;

    // the info factory observed the id, which is the record's position
    assert_eq!(id_rx.recv_timeout(RECV_TIMEOUT)?, expected_id);
    assert_eq!(
        msg_rx.recv_timeout(RECV_TIMEOUT)?,
        Bytes::from_static(b"Hello world")
    );

    stop.stop();
    let server = server_thread.join().unwrap()?;
    // terminal at dispatch: nothing retained
    assert_eq!(server.stream_count(), 0);
    Ok(())
}

#[test]
fn test_no_handler_for_stream_type() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let (trace_tx, trace_rx) = mpsc::channel::<String>();
    let trace: TraceFn = std::sync::Arc::new(move |_seqno, _desc, info, _machine| {
        trace_tx.send(info.description.clone()).ok();
    });

    let mut server = Server::create(&base_path(&tmp), &params, trace)?;
    server.seek_to_end();

    let (msg_tx, msg_rx) = mpsc::channel();
    server.add_handler(
        1,
        |part, trace| {
            let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
            fsm.add_transition(Transition::new(0, EV_ONE, 1, "Single message"));
            fsm
        },
        StateSet::from([1]),
        move |id| {
            msg_tx.send(id).ok();
            StreamInfo::with_id(id)
        },
    );

    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    let client = Client::create(&base_path(&tmp), &params)?;
    client.seek_to_end();

    // nothing registered for type 42
    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        42,
        |part| {
            part.buffer = Bytes::from_static(b"orphan");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;

    // the failure shows up through the trace callback
    let deadline = Instant::now() + RECV_TIMEOUT;
    loop {
        let description = trace_rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))?;
        if description == "Cannot initialize stream" {
            break;
        }
    }

    // the loop survived: a handled stream still goes through
    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        1,
        |part| {
            part.buffer = Bytes::from_static(b"still alive");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;
    msg_rx.recv_timeout(RECV_TIMEOUT)?;

    stop.stop();
    let server = server_thread.join().unwrap()?;
    assert_eq!(server.stream_count(), 0);
    Ok(())
}

#[test]
fn test_nonterminal_dispatch_retains_entry() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let mut server = Server::create(&base_path(&tmp), &params, no_trace())?;
    server.seek_to_end();

    let (id_tx, id_rx) = mpsc::channel();
    server.add_handler(
        5,
        |part, trace| {
            let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
            // ONE moves to state 1, but only state 2 is terminal
            fsm.add_transition(Transition::new(0, EV_ONE, 1, "Single message"));
            fsm
        },
        StateSet::from([2]),
        move |id| {
            id_tx.send(id).ok();
            StreamInfo::with_id(id)
        },
    );

    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    let client = Client::create(&base_path(&tmp), &params)?;
    client.seek_to_end();

    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        5,
        |part| {
            part.buffer = Bytes::from_static(b"pending");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;

    let id = id_rx.recv_timeout(RECV_TIMEOUT)?;
    stop.stop();
    let server = server_thread.join().unwrap()?;

    // the handler is not done: the entry stays, keyed by the assigned id
    assert_eq!(server.stream_count(), 1);
    assert!(server.has_stream(id));
    assert_eq!(server.stream_info(id).unwrap().id, id as i64);
    Ok(())
}

#[test]
fn test_multi_part_stream_evicted_at_end() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let mut server = Server::create(&base_path(&tmp), &params, no_trace())?;
    server.seek_to_end();

    let (part_tx, part_rx) = mpsc::channel::<(u8, u64, Bytes)>();
    server.add_handler(
        7,
        move |part, trace| {
            let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
            fsm.state_name(0, "INIT");
            fsm.state_name(1, "RECEIVING");
            fsm.state_name(2, "DONE");
            set_stream_event_names(&mut fsm);
            let deliver = {
                let tx = part_tx.clone();
                move |core: &mut ServerCore,
                      _seqno: u16,
                      _info: &TransitionInfo,
                      _queue: &mut EventQueue|
                      -> streamgate::Result<()> {
                    let part = core.current_part();
                    tx.send((part.event, part.seqno, part.buffer.clone())).ok();
                    Ok(())
                }
            };
            fsm.add_transition(
                Transition::new(0, EV_START, 1, "stream opened").with_action(
                    1,
                    "DELIVER",
                    deliver.clone(),
                ),
            );
            fsm.add_transition(
                Transition::new(1, EV_NEXT, 1, "part arrived").with_action(
                    1,
                    "DELIVER",
                    deliver.clone(),
                ),
            );
            fsm.add_transition(
                Transition::new(1, EV_END, 2, "stream closed").with_action(1, "DELIVER", deliver),
            );
            fsm
        },
        StateSet::from([2]),
        StreamInfo::with_id,
    );

    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    let client = Client::create(&base_path(&tmp), &params)?;
    client.seek_to_end();

    let mut fsm: StateMachine<()> = StateMachine::new("client", no_trace());
    fsm.add_transition(Transition::new(0, EV_START, 0, "stream opened"));
    fsm.add_transition(Transition::new(0, EV_NEXT, 0, "part sent"));
    fsm.add_transition(Transition::new(0, EV_END, 1, "stream closed"));

    let chunks: [&[u8]; 3] = [b"He", b"llo", b"!"];
    let mut next = 0usize;
    let mut info = StreamInfo::new();
    client.start(
        7,
        |part| {
            part.buffer = Bytes::copy_from_slice(chunks[next]);
            next += 1;
            next < chunks.len()
        },
        &mut fsm,
        &mut (),
        &StateSet::from([1]),
        &mut info,
    )?;

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(part_rx.recv_timeout(RECV_TIMEOUT)?);
    }
    assert_eq!(
        received,
        vec![
            (EV_START as u8, 0, Bytes::from_static(b"He")),
            (EV_NEXT as u8, 1, Bytes::from_static(b"llo")),
            (EV_END as u8, 2, Bytes::from_static(b"!")),
        ]
    );

    stop.stop();
    let server = server_thread.join().unwrap()?;
    // END drove the machine to its terminal state: entry evicted
    assert_eq!(server.stream_count(), 0);
    Ok(())
}

#[test]
fn test_client_stop_reaches_retained_stream() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let mut server = Server::create(&base_path(&tmp), &params, no_trace())?;
    server.seek_to_end();

    let (reason_tx, reason_rx) = mpsc::channel::<Bytes>();
    server.add_handler(
        2,
        move |part, trace| {
            let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
            fsm.add_transition(Transition::new(0, EV_ONE, 1, "Single message"));
            let tx = reason_tx.clone();
            fsm.add_transition(
                Transition::new(1, EV_STOP, 2, "stop requested").with_action(
                    1,
                    "RECORD REASON",
                    move |core: &mut ServerCore, _seqno, _info, _queue| {
                        tx.send(core.current_part().buffer.clone()).ok();
                        Ok(())
                    },
                ),
            );
            fsm
        },
        StateSet::from([2]),
        StreamInfo::with_id,
    );

    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    let client = Client::create(&base_path(&tmp), &params)?;
    client.seek_to_end();

    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        2,
        |part| {
            part.buffer = Bytes::from_static(b"open-ended");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;

    // the STOP control frame drives the retained machine to terminal
    client.stop(info.id as u64, "enough")?;
    assert_eq!(
        reason_rx.recv_timeout(RECV_TIMEOUT)?,
        Bytes::from_static(b"enough")
    );

    stop.stop();
    let server = server_thread.join().unwrap()?;
    assert_eq!(server.stream_count(), 0);
    Ok(())
}

#[test]
fn test_bad_record_does_not_kill_loop() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let mut server = Server::create(&base_path(&tmp), &params, no_trace())?;
    server.seek_to_end();

    let (msg_tx, msg_rx) = mpsc::channel();
    server.add_handler(
        1,
        |part, trace| {
            let mut fsm = StateMachine::new(format!("stream:{}", part.id), trace);
            fsm.add_transition(Transition::new(0, EV_ONE, 1, "Single message"));
            fsm
        },
        StateSet::from([1]),
        move |id| {
            msg_tx.send(id).ok();
            StreamInfo::with_id(id)
        },
    );

    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    // inject garbage straight onto the client-to-server channel: a NEXT
    // header whose id varint never terminates, and an unknown event code
    let publisher = transport::open_publisher(&base_path(&tmp).join("0"), &params);
    publisher.push(&[Bytes::copy_from_slice(&[EV_NEXT as u8, 0x80])])?;
    publisher.push(&[Bytes::copy_from_slice(&[0xAB, 0x01, 0x02])])?;

    let client = Client::create(&base_path(&tmp), &params)?;
    let (mut fsm, terminal) = single_shot_client();
    let mut info = StreamInfo::new();
    client.start(
        1,
        |part| {
            part.buffer = Bytes::from_static(b"after the noise");
            false
        },
        &mut fsm,
        &mut (),
        &terminal,
        &mut info,
    )?;

    msg_rx.recv_timeout(RECV_TIMEOUT)?;
    stop.stop();
    server_thread.join().unwrap()?;
    Ok(())
}

#[test]
fn test_stop_semantics() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params {
        pull_timeout_ms: 100,
        ..Params::default()
    };

    let server = Server::create(&base_path(&tmp), &params, no_trace())?;
    let stop = server.stop_handle();
    let server_thread = spawn_server(server);

    thread::sleep(Duration::from_millis(50));
    let stopped_at = Instant::now();
    stop.stop();

    let server = server_thread.join().unwrap()?;
    // takes effect at the next pull-timeout boundary
    assert!(stopped_at.elapsed() < Duration::from_secs(2));
    assert_eq!(server.state(), ST_STOPPED);
    Ok(())
}

#[test]
fn test_push_event_unknown_stream() -> Result<()> {
    let tmp = TempDir::new()?;
    let params = Params::default();

    let mut server = Server::create(&base_path(&tmp), &params, no_trace())?;
    let err = server.push_event(9999, EV_STOP, false).unwrap_err();
    assert!(matches!(
        err,
        streamgate::GatewayError::UnknownStream(9999)
    ));
    Ok(())
}
