//! In-process world: every rank is a `LocalComm` handle, typically driven
//! from its own thread, with one `flume` inbox per rank.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use log::debug;

use super::{
    COLLECTIVE_BIT, Communicator, Payload, RecvRequest, SendRequest, Tag, make_tag, next_epoch,
    tag_epoch,
};
use crate::error::CommError;

const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);

struct Envelope {
    source: usize,
    tag: Tag,
    payload: Payload,
}

/// Factory for a set of connected in-process ranks.
pub struct LocalWorld;

impl LocalWorld {
    /// Create `size` connected ranks (at least one).
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<LocalComm> {
        Self::with_timeout(size, DEFAULT_RECV_TIMEOUT)
    }

    pub fn with_timeout(size: usize, timeout: Duration) -> Vec<LocalComm> {
        let size = size.max(1);
        let (senders, receivers): (Vec<Sender<Envelope>>, Vec<Receiver<Envelope>>) =
            (0..size).map(|_| flume::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalComm {
                rank,
                size,
                peers: senders.clone(),
                inbox,
                stash: Mutex::new(VecDeque::new()),
                epoch: AtomicU32::new(0),
                collective_seq: AtomicU32::new(0),
                sent: AtomicUsize::new(0),
                timeout,
            })
            .collect()
    }
}

pub struct LocalComm {
    rank: usize,
    size: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    /// Arrived messages not yet claimed by a posted receive, oldest first.
    stash: Mutex<VecDeque<Envelope>>,
    epoch: AtomicU32,
    collective_seq: AtomicU32,
    sent: AtomicUsize,
    timeout: Duration,
}

impl LocalComm {
    #[inline]
    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Messages of the current epoch or the next one may still be claimed.
    fn is_live(&self, tag: Tag) -> bool {
        let epoch = self.epoch.load(Ordering::Acquire);
        let e = tag_epoch(tag);
        e == epoch || e == next_epoch(epoch)
    }

    fn match_pending(pending: &[RecvRequest], env: &Envelope) -> Option<usize> {
        pending
            .iter()
            .position(|req| req.source == env.source && req.tag == env.tag)
    }
}

impl Communicator for LocalComm {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    fn post_send(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, CommError> {
        self.check_rank(dest)?;
        self.peers[dest]
            .send(Envelope {
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| CommError::Disconnected { peer: dest })?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(SendRequest { dest, tag })
    }

    fn wait_any(&self, pending: &[RecvRequest]) -> Result<(usize, Payload), CommError> {
        for req in pending {
            self.check_rank(req.source)?;
        }
        let Some(first) = pending.first() else {
            return Err(CommError::UnexpectedPayload {
                peer: self.rank,
                tag: 0,
                reason: "wait_any with no posted receives".to_string(),
            });
        };

        let mut stash = self.stash.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((pos, idx)) = stash
            .iter()
            .enumerate()
            .find_map(|(pos, env)| Self::match_pending(pending, env).map(|idx| (pos, idx)))
        {
            if let Some(env) = stash.remove(pos) {
                return Ok((idx, env.payload));
            }
        }

        loop {
            let env = match self.inbox.recv_timeout(self.timeout) {
                Ok(env) => env,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CommError::Timeout {
                        peer: first.source,
                        tag: first.tag,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CommError::Disconnected { peer: first.source });
                }
            };
            match Self::match_pending(pending, &env) {
                Some(idx) => return Ok((idx, env.payload)),
                None if self.is_live(env.tag) => stash.push_back(env),
                None => debug!(
                    "rank {}: dropping stale message from rank {} (tag {:#x})",
                    self.rank,
                    env.source,
                    env.tag
                ),
            }
        }
    }

    fn wait_all_sends(&self, sends: Vec<SendRequest>) -> Result<(), CommError> {
        // Unbounded channels complete a send at post time.
        for req in &sends {
            self.check_rank(req.dest)?;
        }
        Ok(())
    }

    fn begin_epoch(&self, epoch: u32) {
        let mut stash = self.stash.lock().unwrap_or_else(|e| e.into_inner());
        self.epoch.store(epoch, Ordering::Release);
        self.collective_seq.store(0, Ordering::Relaxed);
        stash.extend(self.inbox.try_iter());
        let before = stash.len();
        stash.retain(|env| self.is_live(env.tag));
        let dropped = before - stash.len();
        if dropped > 0 {
            debug!("rank {}: epoch {epoch} discarded {dropped} stale messages", self.rank);
        }
    }

    #[inline]
    fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    fn next_collective_tag(&self) -> Tag {
        let seq = self.collective_seq.fetch_add(1, Ordering::Relaxed);
        make_tag(COLLECTIVE_BIT, self.epoch(), seq)
    }

    #[inline]
    fn messages_sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}
