//! Rank-to-rank messaging used by the decomposer and the transfer executor.
//!
//! Only rank identity, buffered point-to-point sends, out-of-order receive
//! completion and two collectives are needed. Collectives are provided on
//! top of the point-to-point layer, with their own reserved tag space.
//!
//! A tag carries the frame epoch next to the transaction id or collective
//! sequence number, so a message left over from an aborted frame can never
//! satisfy a receive posted in a later one:
//!
//! ```text
//!  63  62  61..32   31..0
//!  C   S   epoch    id / sequence
//! ```

mod local;

pub use local::{LocalComm, LocalWorld};

use log::warn;

use crate::error::CommError;
use crate::extent::PixelExtent;

pub type Tag = u64;

/// Set on every collective tag.
pub const COLLECTIVE_BIT: Tag = 1 << 63;

/// Set on scatter transfer tags; gather tags leave it clear.
pub const SCATTER_BIT: Tag = 1 << 62;

const EPOCH_SHIFT: u32 = 32;

/// Epochs wrap inside this mask.
pub const EPOCH_MASK: u32 = (1 << 30) - 1;

/// Compose a tag from its class bits, epoch and low word.
#[inline]
pub fn make_tag(class: Tag, epoch: u32, low: u32) -> Tag {
    class | (Tag::from(epoch & EPOCH_MASK) << EPOCH_SHIFT) | Tag::from(low)
}

#[inline]
pub fn tag_epoch(tag: Tag) -> u32 {
    // Masked to 30 bits, so the cast is lossless.
    ((tag >> EPOCH_SHIFT) as u32) & EPOCH_MASK
}

#[inline]
pub fn next_epoch(epoch: u32) -> u32 {
    epoch.wrapping_add(1) & EPOCH_MASK
}

/// Message body. Pixel blocks travel as packed RGBA rows.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Pixels(Vec<f32>),
    Extents(Vec<PixelExtent>),
    Scalars(Vec<f64>),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Pixels(_) => "pixels",
            Payload::Extents(_) => "extents",
            Payload::Scalars(_) => "scalars",
        }
    }

    pub fn into_pixels(self, peer: usize, tag: Tag) -> Result<Vec<f32>, CommError> {
        match self {
            Payload::Pixels(v) => Ok(v),
            other => Err(unexpected(peer, tag, "pixels", other.kind())),
        }
    }

    pub fn into_extents(self, peer: usize, tag: Tag) -> Result<Vec<PixelExtent>, CommError> {
        match self {
            Payload::Extents(v) => Ok(v),
            other => Err(unexpected(peer, tag, "extents", other.kind())),
        }
    }

    pub fn into_scalars(self, peer: usize, tag: Tag) -> Result<Vec<f64>, CommError> {
        match self {
            Payload::Scalars(v) => Ok(v),
            other => Err(unexpected(peer, tag, "scalars", other.kind())),
        }
    }
}

fn unexpected(peer: usize, tag: Tag, wanted: &str, got: &str) -> CommError {
    CommError::UnexpectedPayload {
        peer,
        tag,
        reason: format!("expected {wanted}, got {got}"),
    }
}

/// A posted receive, matched by `(source, tag)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvRequest {
    pub source: usize,
    pub tag: Tag,
}

impl RecvRequest {
    pub fn new(source: usize, tag: Tag) -> Self {
        Self { source, tag }
    }
}

/// Handle of an in-flight send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub dest: usize,
    pub tag: Tag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
}

impl ReduceOp {
    #[inline]
    pub fn identity(self) -> f64 {
        match self {
            ReduceOp::Min => f64::INFINITY,
            ReduceOp::Max => f64::NEG_INFINITY,
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Post a buffered send. The payload is owned by the message layer once
    /// this returns.
    fn post_send(&self, dest: usize, tag: Tag, payload: Payload) -> Result<SendRequest, CommError>;

    /// Block until one of `pending` is satisfied. Returns its index and the
    /// payload. Messages that match none of them are kept for later calls.
    fn wait_any(&self, pending: &[RecvRequest]) -> Result<(usize, Payload), CommError>;

    /// Block until every send in `sends` has been handed off.
    fn wait_all_sends(&self, sends: Vec<SendRequest>) -> Result<(), CommError>;

    /// Start a frame. Resets the collective sequence and discards buffered
    /// messages from any epoch other than `epoch` and the one after it.
    fn begin_epoch(&self, epoch: u32);

    /// Epoch set by the last `begin_epoch`, 0 before the first.
    fn epoch(&self) -> u32;

    /// Next tag in the collective tag space of the current epoch. All ranks
    /// must call collectives in the same order so that their sequence
    /// numbers agree.
    fn next_collective_tag(&self) -> Tag;

    /// Point-to-point messages posted so far, collectives included.
    fn messages_sent(&self) -> usize;

    fn recv(&self, source: usize, tag: Tag) -> Result<Payload, CommError> {
        let (_, payload) = self.wait_any(&[RecvRequest::new(source, tag)])?;
        Ok(payload)
    }

    /// Exchange variable-length extent lists; entry `r` holds rank `r`'s list.
    fn all_gather_extents(&self, local: &[PixelExtent]) -> Result<Vec<Vec<PixelExtent>>, CommError> {
        let (rank, size) = (self.rank(), self.size());
        let tag = self.next_collective_tag();
        let mut out = vec![Vec::new(); size];
        out[rank] = local.to_vec();
        if size == 1 {
            return Ok(out);
        }
        let mut sends = Vec::with_capacity(size - 1);
        for peer in (0..size).filter(|&p| p != rank) {
            sends.push(self.post_send(peer, tag, Payload::Extents(local.to_vec()))?);
        }
        let mut pending: Vec<RecvRequest> = (0..size)
            .filter(|&p| p != rank)
            .map(|p| RecvRequest::new(p, tag))
            .collect();
        while !pending.is_empty() {
            let (idx, payload) = self.wait_any(&pending)?;
            let req = pending.swap_remove(idx);
            out[req.source] = payload.into_extents(req.source, tag)?;
        }
        self.wait_all_sends(sends)?;
        Ok(out)
    }

    /// Element-wise reduction across all ranks. Contributions are combined in
    /// rank order, so every rank ends with the same values.
    fn all_reduce(&self, local: &[f64], op: ReduceOp) -> Result<Vec<f64>, CommError> {
        let (rank, size) = (self.rank(), self.size());
        if size == 1 {
            return Ok(local.to_vec());
        }
        let tag = self.next_collective_tag();
        let mut sends = Vec::with_capacity(size - 1);
        for peer in (0..size).filter(|&p| p != rank) {
            sends.push(self.post_send(peer, tag, Payload::Scalars(local.to_vec()))?);
        }
        let mut contributions = vec![Vec::new(); size];
        contributions[rank] = local.to_vec();
        let mut pending: Vec<RecvRequest> = (0..size)
            .filter(|&p| p != rank)
            .map(|p| RecvRequest::new(p, tag))
            .collect();
        while !pending.is_empty() {
            let (idx, payload) = self.wait_any(&pending)?;
            let req = pending.swap_remove(idx);
            let values = payload.into_scalars(req.source, tag)?;
            if values.len() != local.len() {
                return Err(CommError::UnexpectedPayload {
                    peer: req.source,
                    tag,
                    reason: format!("reduce length {} != {}", values.len(), local.len()),
                });
            }
            contributions[req.source] = values;
        }
        self.wait_all_sends(sends)?;

        let mut out = vec![op.identity(); local.len()];
        for values in &contributions {
            for (acc, v) in out.iter_mut().zip(values) {
                *acc = op.apply(*acc, *v);
            }
        }
        Ok(out)
    }

    /// True on every rank only when every rank reports `ok`. A failed
    /// exchange counts as a veto.
    fn all_ok(&self, ok: bool) -> bool {
        match self.all_reduce(&[if ok { 1.0 } else { 0.0 }], ReduceOp::Min) {
            Ok(v) => ok && v.first().is_some_and(|&f| f > 0.5),
            Err(err) => {
                warn!("rank {}: agreement exchange failed: {err}", self.rank());
                false
            }
        }
    }

    /// Bounding union of every rank's extents.
    fn all_reduce_bounds(&self, local: &PixelExtent) -> Result<PixelExtent, CommError> {
        let all = self.all_gather_extents(std::slice::from_ref(local))?;
        Ok(all
            .iter()
            .flatten()
            .fold(PixelExtent::empty(), |acc, e| acc | *e))
    }
}
