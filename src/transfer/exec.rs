//! Transfer program execution.

use log::{debug, error};

use super::program::{Transaction, TransferProgram};
use crate::comm::{Communicator, Payload, RecvRequest};
use crate::error::{CommError, LicError, LicResult};
use crate::image::{COMPONENTS, Image};

/// Per-rank counters of one execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub local: usize,
    pub sent: usize,
    pub received: usize,
    pub pixels_local: usize,
    pub pixels_sent: usize,
    pub pixels_received: usize,
}

fn fail(program: &TransferProgram, rank: usize, t: &Transaction, peer: usize, err: CommError) -> LicError {
    error!(
        "rank {rank}: {} transaction {} with rank {peer} failed: {err}",
        program.kind(),
        t.id
    );
    LicError::transfer(t.id, peer, err)
}

impl TransferProgram {
    /// Run this rank's share of the program: `src` holds the source
    /// decomposition's pixels, `dest` receives the destination blocks.
    ///
    /// Destination blocks are zeroed first, then every transaction is added
    /// onto exactly its own extent, so arrival order does not matter. Local
    /// copies run while remote blocks are in flight. Returns once all
    /// receives have landed and all sends were handed off.
    pub fn execute(
        &self,
        comm: &dyn Communicator,
        src: &Image,
        dest: &mut Image,
    ) -> LicResult<TransferStats> {
        let (rank, epoch) = (comm.rank(), comm.epoch());
        let tag_of = |t: &Transaction, peer: usize| {
            self.tag(t, epoch)
                .ok_or_else(|| fail(self, rank, t, peer, CommError::TagOverflow { id: t.id }))
        };
        let mut stats = TransferStats::default();

        for block in self.dest_blocks(rank) {
            dest.clear_extent(block, [0.0; 4]);
        }

        let mut incoming: Vec<&Transaction> = Vec::new();
        let mut sends = Vec::new();
        for t in self.involving(rank) {
            if t.dest_rank == rank && t.source_rank != rank {
                incoming.push(t);
            } else if t.source_rank == rank && t.dest_rank != rank {
                let tag = tag_of(t, t.dest_rank)?;
                let block = src.pack(&t.source_extent);
                stats.sent += 1;
                stats.pixels_sent += block.len() / COMPONENTS;
                let req = comm
                    .post_send(t.dest_rank, tag, Payload::Pixels(block))
                    .map_err(|e| fail(self, rank, t, t.dest_rank, e))?;
                sends.push(req);
            }
        }

        for t in self.involving(rank).filter(|t| t.is_local_to(rank)) {
            dest.accumulate_from(src, &t.dest_extent);
            stats.local += 1;
            stats.pixels_local += t.dest_extent.size();
        }

        let mut pending = Vec::with_capacity(incoming.len());
        for &t in &incoming {
            pending.push(RecvRequest::new(t.source_rank, tag_of(t, t.source_rank)?));
        }
        while !pending.is_empty() {
            let (idx, payload) = match comm.wait_any(&pending) {
                Ok(done) => done,
                Err(e) => {
                    let t = match &e {
                        CommError::Timeout { peer, tag } => incoming
                            .iter()
                            .zip(&pending)
                            .find(|(_, req)| req.source == *peer && req.tag == *tag)
                            .map(|(t, _)| *t)
                            .unwrap_or(incoming[0]),
                        _ => incoming[0],
                    };
                    return Err(fail(self, rank, t, t.source_rank, e));
                }
            };
            let tag = pending.swap_remove(idx).tag;
            let t = incoming.swap_remove(idx);
            let block = payload
                .into_pixels(t.source_rank, tag)
                .map_err(|e| fail(self, rank, t, t.source_rank, e))?;
            if !dest.accumulate(&t.dest_extent, &block) {
                let e = CommError::UnexpectedPayload {
                    peer: t.source_rank,
                    tag,
                    reason: format!(
                        "{} values for extent {} of {} pixels",
                        block.len(),
                        t.dest_extent,
                        t.dest_extent.size()
                    ),
                };
                return Err(fail(self, rank, t, t.source_rank, e));
            }
            stats.received += 1;
            stats.pixels_received += t.dest_extent.size();
        }

        comm.wait_all_sends(sends)?;

        debug!(
            "rank {rank}: {} done, {} local ({} px), {} sent ({} px), {} received ({} px)",
            self.kind(),
            stats.local,
            stats.pixels_local,
            stats.sent,
            stats.pixels_sent,
            stats.received,
            stats.pixels_received
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::comm::{Communicator, LocalWorld};
    use crate::extent::PixelExtent;
    use crate::image::Image;
    use crate::transfer::{TransferKind, TransferProgram};

    #[test]
    fn single_rank_program_never_messages() {
        let world = LocalWorld::new(1);
        let sources = vec![vec![PixelExtent::new(0, 15, 0, 7), PixelExtent::new(0, 15, 8, 15)]];
        let dests = vec![vec![PixelExtent::new(2, 13, 2, 13)]];
        let program = TransferProgram::build(TransferKind::Gather, &sources, &dests);
        assert_eq!(program.remote_count(), 0);

        let src = Image::from_fn([16, 16], |i, j| [i as f32, j as f32, 0.5, 1.0]);
        let mut dest = Image::filled([16, 16], [9.0; 4]);
        let stats = program.execute(&world[0], &src, &mut dest).unwrap();
        assert_eq!(stats.sent + stats.received, 0);
        assert_eq!(world[0].messages_sent(), 0);
        assert_eq!(dest.pixel(5, 9), [5.0, 9.0, 0.5, 1.0]);
        assert_eq!(dest.pixel(1, 9), [9.0; 4]);
    }

    #[test]
    fn two_rank_exchange_assembles_guarded_blocks() {
        let sources = vec![vec![PixelExtent::new(0, 7, 0, 3)], vec![PixelExtent::new(0, 7, 4, 7)]];
        let dests = vec![vec![PixelExtent::new(0, 7, 0, 5)], vec![PixelExtent::new(0, 7, 2, 7)]];
        let program = TransferProgram::build(TransferKind::Gather, &sources, &dests);
        assert_eq!(program.local_count(), 2);
        assert_eq!(program.remote_count(), 2);

        let handles: Vec<_> = LocalWorld::new(2)
            .into_iter()
            .map(|comm| {
                let program = program.clone();
                let sources = sources.clone();
                thread::spawn(move || {
                    let rank = comm.rank();
                    let mut src = Image::new([8, 8]);
                    for ext in &sources[rank] {
                        for j in ext.rows() {
                            for i in ext.xmin()..=ext.xmax() {
                                src.set_pixel(i, j, [(i + 10 * j) as f32, rank as f32, 0.0, 1.0]);
                            }
                        }
                    }
                    let mut dest = Image::new([8, 8]);
                    program.execute(&comm, &src, &mut dest).unwrap();
                    dest
                })
            })
            .collect();
        let results: Vec<Image> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results[0].pixel(3, 5), [53.0, 1.0, 0.0, 1.0]);
        assert_eq!(results[0].pixel(3, 1), [13.0, 0.0, 0.0, 1.0]);
        assert_eq!(results[0].pixel(3, 6), [0.0; 4]);
        assert_eq!(results[1].pixel(3, 2), [23.0, 0.0, 0.0, 1.0]);
    }
}
