//! Transfer program construction.

use std::fmt;

use crate::comm::{SCATTER_BIT, Tag, make_tag};
use crate::decomp::Decomposition;
use crate::extent::{PixelExtent, merge, subtract_all};

/// Direction of a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Geometry decomposition onto guarded LIC blocks.
    Gather,
    /// Valid LIC blocks back onto the geometry decomposition.
    Scatter,
}

impl TransferKind {
    /// Class bits of this direction's tags.
    #[inline]
    pub fn tag_class(self) -> Tag {
        match self {
            TransferKind::Gather => 0,
            TransferKind::Scatter => SCATTER_BIT,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Gather => f.write_str("gather"),
            TransferKind::Scatter => f.write_str("scatter"),
        }
    }
}

/// One scheduled block move. Source and destination extents are equal:
/// every image is in screen coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: usize,
    pub source_rank: usize,
    pub source_extent: PixelExtent,
    pub dest_rank: usize,
    pub dest_extent: PixelExtent,
}

impl Transaction {
    /// Same-rank copy on `rank`.
    #[inline]
    pub fn is_local_to(&self, rank: usize) -> bool {
        self.source_rank == rank && self.dest_rank == rank
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        self.source_rank != self.dest_rank
    }
}

/// Ordered transactions plus the destination blocks they fill. Built
/// identically on every rank.
#[derive(Clone, Debug, PartialEq)]
pub struct TransferProgram {
    kind: TransferKind,
    dest_blocks: Vec<Vec<PixelExtent>>,
    transactions: Vec<Transaction>,
}

impl TransferProgram {
    /// Program that moves nothing.
    pub fn empty(kind: TransferKind, size: usize) -> Self {
        Self {
            kind,
            dest_blocks: vec![Vec::new(); size],
            transactions: Vec::new(),
        }
    }

    /// Fill every destination block from the source decomposition.
    ///
    /// Sources are taken in order of preference: the destination rank
    /// itself, then the others by rank. Each source contributes only what
    /// earlier ones did not already cover, so the transactions of one
    /// destination block never overlap even if sources do.
    pub fn build(
        kind: TransferKind,
        sources: &[Vec<PixelExtent>],
        dests: &[Vec<PixelExtent>],
    ) -> Self {
        let mut transactions = Vec::new();
        for (dest_rank, blocks) in dests.iter().enumerate() {
            let mut order: Vec<usize> = (0..sources.len()).filter(|&r| r != dest_rank).collect();
            if dest_rank < sources.len() {
                order.insert(0, dest_rank);
            }
            for dest in blocks {
                let mut covered: Vec<PixelExtent> = Vec::new();
                for &source_rank in &order {
                    for src in &sources[source_rank] {
                        let overlap = *dest & *src;
                        if overlap.is_empty() {
                            continue;
                        }
                        let pieces = merge(&subtract_all(&[overlap], &covered));
                        for piece in pieces {
                            transactions.push(Transaction {
                                id: transactions.len(),
                                source_rank,
                                source_extent: piece,
                                dest_rank,
                                dest_extent: piece,
                            });
                            covered.push(piece);
                        }
                    }
                }
            }
        }
        Self {
            kind,
            dest_blocks: dests.to_vec(),
            transactions,
        }
    }

    /// Geometry blocks onto guarded LIC blocks.
    pub fn gather(decomp: &Decomposition) -> Self {
        Self::build(TransferKind::Gather, &decomp.geometry, &decomp.guarded)
    }

    /// Valid LIC blocks back onto geometry blocks.
    pub fn scatter(decomp: &Decomposition) -> Self {
        Self::build(TransferKind::Scatter, &decomp.lic, &decomp.geometry)
    }

    #[inline]
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    #[inline]
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Destination blocks owned by `rank`.
    pub fn dest_blocks(&self, rank: usize) -> &[PixelExtent] {
        self.dest_blocks.get(rank).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tag of `t` in `epoch`, or `None` when its id does not fit the
    /// 32-bit id field.
    #[inline]
    pub fn tag(&self, t: &Transaction, epoch: u32) -> Option<Tag> {
        let id = u32::try_from(t.id).ok()?;
        Some(make_tag(self.kind.tag_class(), epoch, id))
    }

    pub fn local_count(&self) -> usize {
        self.transactions.iter().filter(|t| !t.is_remote()).count()
    }

    pub fn remote_count(&self) -> usize {
        self.transactions.iter().filter(|t| t.is_remote()).count()
    }

    /// Transactions `rank` takes part in.
    pub fn involving(&self, rank: usize) -> impl Iterator<Item = &Transaction> {
        self.transactions
            .iter()
            .filter(move |t| t.source_rank == rank || t.dest_rank == rank)
    }
}
