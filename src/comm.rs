//! Tagged point-to-point messaging between worker ranks.
//!
//! [`Comm`] is one worker's endpoint into the pool: a bounded sending
//! channel per peer and a single inbox, demultiplexed by `(source, tag)`
//! into FIFO queues. The API mirrors nonblocking message passing:
//! [`Comm::isend`] starts a send and hands back a [`SendReq`] that is
//! retried by [`Comm::test`] until the bounded channel accepts it, and
//! receives are polled per `(source, tag)` pair.
//!
//! Bounded channels are load-bearing here: a slow receiver makes sends
//! stay in flight, which is what drives the bridge's backoff and
//! buffering machinery.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Messages a rank can keep in its channel before senders see backpressure.
pub(crate) const CHANNEL_CAP: usize = 256;

/// One wire message between two ranks.
#[derive(Debug)]
pub struct Message {
    pub src: usize,
    pub tag: i32,
    pub bytes: Vec<u8>,
}

/// An in-flight nonblocking send.
///
/// `payload` is held until the channel accepts it; the row data stays alive
/// exactly as long as the send is outstanding.
#[derive(Debug)]
pub struct SendReq {
    to: usize,
    tag: i32,
    payload: Option<Vec<u8>>,
}

impl SendReq {
    /// Whether the message has been handed to the transport.
    pub fn done(&self) -> bool {
        self.payload.is_none()
    }
}

/// A worker's transport endpoint.
pub struct Comm {
    rank: usize,
    peers: Vec<Sender<Message>>,
    inbox: Receiver<Message>,
    held: RefCell<HashMap<(usize, i32), VecDeque<Vec<u8>>>>,
}

impl Comm {
    pub(crate) fn new(rank: usize, peers: Vec<Sender<Message>>, inbox: Receiver<Message>) -> Self {
        Self {
            rank,
            peers,
            inbox,
            held: RefCell::new(HashMap::new()),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nprocs(&self) -> usize {
        self.peers.len()
    }

    /// Start a nonblocking send; the message may or may not have left yet.
    pub fn isend(&self, to: usize, tag: i32, bytes: Vec<u8>) -> SendReq {
        let mut req = SendReq {
            to,
            tag,
            payload: Some(bytes),
        };
        self.test(&mut req);
        req
    }

    /// Retry an in-flight send; returns true once it has been delivered to
    /// the transport.
    pub fn test(&self, req: &mut SendReq) -> bool {
        let Some(bytes) = req.payload.take() else {
            return true;
        };
        match self.peers[req.to].try_send(Message {
            src: self.rank,
            tag: req.tag,
            bytes,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) | Err(TrySendError::Disconnected(msg)) => {
                req.payload = Some(msg.bytes);
                false
            }
        }
    }

    /// Block until an in-flight send completes.
    pub fn wait(&self, req: &mut SendReq) -> Result<()> {
        if let Some(bytes) = req.payload.take() {
            self.peers[req.to]
                .send(Message {
                    src: self.rank,
                    tag: req.tag,
                    bytes,
                })
                .with_context(|| format!("peer rank {} hung up", req.to))?;
        }
        Ok(())
    }

    /// Nonblocking receive for one `(source, tag)` channel.
    pub fn try_recv(&self, src: usize, tag: i32) -> Option<Vec<u8>> {
        self.drain_inbox();
        self.held
            .borrow_mut()
            .get_mut(&(src, tag))
            .and_then(|q| q.pop_front())
    }

    /// Whether a message is waiting on `(source, tag)` without consuming it.
    pub fn probe(&self, src: usize, tag: i32) -> bool {
        self.drain_inbox();
        self.held
            .borrow()
            .get(&(src, tag))
            .is_some_and(|q| !q.is_empty())
    }

    fn drain_inbox(&self) {
        let mut held = self.held.borrow_mut();
        while let Ok(msg) = self.inbox.try_recv() {
            held.entry((msg.src, msg.tag))
                .or_default()
                .push_back(msg.bytes);
        }
    }

    /// Drop any demuxed messages left over from a finished run.
    pub fn clear_stale(&self) {
        self.drain_inbox();
        self.held.borrow_mut().clear();
    }
}
