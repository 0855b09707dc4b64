//! Client engine: drives one outbound stream to completion.

use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;
use crate::fsm::StateMachine;
use crate::transport::Params;
use crate::wire::Frame;

use super::{Gateway, StateSet, StreamInfo, StreamPart};

/// Sending side of a gateway pair.
pub struct Client {
    gateway: Gateway,
}

impl Client {
    pub fn create(base_path: &Path, params: &Params) -> Result<Self> {
        Ok(Self {
            gateway: Gateway::new(base_path, "0", "1", params)?,
        })
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

    /// Drive one logical stream until `fsm` reaches a terminal state.
    ///
    /// Each iteration advances the send sequence counter, lets `feeder` fill
    /// the part's payload (its return value means "more parts will follow"),
    /// frames and transmits the part, feeds the transmitted event to `fsm`,
    /// and advances the machine one step. The first packet assigns the
    /// stream's identity from the current outbound write position; once the
    /// feeder is exhausted the loop keeps advancing the machine, so the
    /// caller's machine must reach a terminal state for `start` to return.
    ///
    /// A feeder that signals "no more" on its very first call still sends
    /// exactly one packet.
    pub fn start<C, F>(
        &self,
        stream_type: u8,
        mut feeder: F,
        fsm: &mut StateMachine<C>,
        ctx: &mut C,
        terminal_states: &StateSet,
        info: &mut StreamInfo,
    ) -> Result<()>
    where
        F: FnMut(&mut StreamPart) -> bool,
    {
        let mut fsm_state: u16 = 0;
        let mut send_more = true;

        loop {
            if send_more {
                info.sent_seqno += 1;

                let mut part = StreamPart {
                    seqno: info.sent_seqno as u64,
                    id: if info.id == -1 {
                        self.gateway.sender_position()
                    } else {
                        info.id as u64
                    },
                    stream_type,
                    ..StreamPart::default()
                };
                send_more = feeder(&mut part);

                let frame = if info.id == -1 {
                    // first packet: the write position becomes the stream id
                    let id = self.gateway.sender_position();
                    info.id = id as i64;
                    if send_more {
                        Frame::Start {
                            stream_type,
                            id,
                            data: part.buffer.clone(),
                        }
                    } else {
                        Frame::Single {
                            stream_type,
                            id,
                            data: part.buffer.clone(),
                        }
                    }
                } else if send_more {
                    Frame::Next {
                        id: info.id as u64,
                        seqno: info.sent_seqno as u64,
                        data: part.buffer.clone(),
                    }
                } else {
                    Frame::Last {
                        id: info.id as u64,
                        seqno: info.sent_seqno as u64,
                        data: part.buffer.clone(),
                    }
                };

                let event = frame.event();
                self.gateway.send(&frame.segments())?;
                if !event.is_first_packet() {
                    info.sent_pos = self.gateway.sender_position();
                }
                fsm.enqueue(event as u8 as u16);
            }

            fsm_state = fsm.run(fsm_state, ctx)?;
            if terminal_states.contains(&fsm_state) {
                break;
            }
        }

        debug!(
            id = info.id,
            parts = info.sent_seqno + 1,
            state = fsm_state,
            "stream sent"
        );
        Ok(())
    }

    /// Ask the other side to stop emitting parts of stream `id`.
    pub fn stop(&self, id: u64, reason: &str) -> Result<()> {
        let frame = Frame::Stop {
            id,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        };
        self.gateway.send(&frame.segments())
    }

    /// Ask the other side to resend part `seqno` of stream `id`.
    pub fn request_resend(&self, id: u64, seqno: u64) -> Result<()> {
        let frame = Frame::Fix { id, seqno };
        self.gateway.send(&frame.segments())
    }

    /// Report a stream-level failure to the other side.
    pub fn report_error(&self, id: u64, seqno: u64, reason: &str) -> Result<()> {
        let frame = Frame::Error {
            id,
            seqno,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        };
        self.gateway.send(&frame.segments())
    }
}
