//! Ping-pong buffers and the image roles the passes bind.

use std::fmt;

use crate::error::{LicError, LicResult};
use crate::extent::PixelExtent;
use crate::image::{Image, Rgba};

/// Clear value of the LIC buffers: empty accumulator, masked.
pub const LIC_CLEAR: Rgba = [0.0, 1.0, 0.0, 0.0];

/// Pixels added around each compute extent when clearing, so that filter
/// taps at the edge read defined values.
pub const CLEAR_HALO: i32 = 4;

/// Every image a pass can read or write. Each role has a fixed binding
/// slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceRole {
    Vector,
    MaskVector,
    Noise,
    LicA,
    LicB,
    SeedA,
    SeedB,
    EdgeEnhance,
    ImageVector,
}

impl ResourceRole {
    pub const ALL: [ResourceRole; 9] = [
        ResourceRole::Vector,
        ResourceRole::MaskVector,
        ResourceRole::Noise,
        ResourceRole::LicA,
        ResourceRole::LicB,
        ResourceRole::SeedA,
        ResourceRole::SeedB,
        ResourceRole::EdgeEnhance,
        ResourceRole::ImageVector,
    ];

    #[inline]
    pub const fn binding_slot(self) -> usize {
        match self {
            ResourceRole::Vector => 0,
            ResourceRole::MaskVector => 1,
            ResourceRole::Noise => 2,
            ResourceRole::LicA => 3,
            ResourceRole::LicB => 4,
            ResourceRole::SeedA => 5,
            ResourceRole::SeedB => 6,
            ResourceRole::EdgeEnhance => 7,
            ResourceRole::ImageVector => 8,
        }
    }
}

impl fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self, self.binding_slot())
    }
}

/// Buffers read by a pass.
pub struct ReadSet<'a> {
    pub lic: &'a Image,
    pub seed: &'a Image,
    /// Vector field in screen units, zero outside the compute extents.
    pub vectors: &'a Image,
}

/// Buffers written by a pass.
pub struct WriteSet<'a> {
    pub lic: &'a mut Image,
    pub seed: &'a mut Image,
}

/// Integrator-owned buffers for one frame.
///
/// `read` names the pair last written. A pass reads `read`, writes the
/// other pair, then `swap` makes its output current.
pub struct PingPongBuffers {
    dims: [usize; 2],
    lic: [Image; 2],
    seed: [Image; 2],
    edge: Option<Image>,
    image_vectors: Image,
    read: usize,
}

impl PingPongBuffers {
    pub fn new(dims: [usize; 2], enhanced: bool) -> Self {
        Self {
            dims,
            lic: [Image::filled(dims, LIC_CLEAR), Image::filled(dims, LIC_CLEAR)],
            seed: [Image::new(dims), Image::new(dims)],
            edge: enhanced.then(|| Image::new(dims)),
            image_vectors: Image::new(dims),
            read: 0,
        }
    }

    #[inline]
    pub fn dims(&self) -> [usize; 2] {
        self.dims
    }

    #[inline]
    pub fn read_index(&self) -> usize {
        self.read
    }

    #[inline]
    pub fn swap(&mut self) {
        self.read ^= 1;
    }

    /// Role of the LIC buffer currently holding the result.
    #[inline]
    pub fn current_lic_role(&self) -> ResourceRole {
        if self.read == 0 { ResourceRole::LicA } else { ResourceRole::LicB }
    }

    #[inline]
    pub fn current_lic(&self) -> &Image {
        &self.lic[self.read]
    }

    pub fn into_current_lic(self) -> Image {
        let [a, b] = self.lic;
        if self.read == 0 { a } else { b }
    }

    /// Split into the current (read) pair and the scratch (write) pair.
    pub fn split(&mut self) -> (ReadSet<'_>, WriteSet<'_>) {
        let [lic_a, lic_b] = &mut self.lic;
        let [seed_a, seed_b] = &mut self.seed;
        let vectors = &self.image_vectors;
        if self.read == 0 {
            (
                ReadSet { lic: lic_a, seed: seed_a, vectors },
                WriteSet { lic: lic_b, seed: seed_b },
            )
        } else {
            (
                ReadSet { lic: lic_b, seed: seed_b, vectors },
                WriteSet { lic: lic_a, seed: seed_a },
            )
        }
    }

    pub fn image_vectors(&self) -> &Image {
        &self.image_vectors
    }

    pub fn image_vectors_mut(&mut self) -> &mut Image {
        &mut self.image_vectors
    }

    /// Edge-enhance target together with the current LIC buffer.
    pub fn edge_with_current(&mut self) -> LicResult<(&Image, &mut Image)> {
        let lic = &self.lic[self.read];
        let edge = self
            .edge
            .as_mut()
            .ok_or_else(|| LicError::resource("EE", "edge-enhance buffer was not allocated"))?;
        Ok((lic, edge))
    }

    /// Move the edge-enhanced image out, e.g. to serve as second-pass input.
    pub fn take_edge(&mut self) -> Option<Image> {
        self.edge.take()
    }

    /// Reset both pairs over `extents` grown by `CLEAR_HALO`, clipped to the
    /// buffer. The edge buffer is cleared too when `clear_edge` is set.
    pub fn clear(&mut self, extents: &[PixelExtent], clear_edge: bool) {
        let screen = PixelExtent::from_size(self.dims[0], self.dims[1]);
        for ext in extents {
            let halo = ext.grown(CLEAR_HALO) & screen;
            for lic in &mut self.lic {
                lic.clear_extent(&halo, LIC_CLEAR);
            }
            for seed in &mut self.seed {
                seed.clear_extent(&halo, [0.0; 4]);
            }
            if clear_edge {
                if let Some(edge) = self.edge.as_mut() {
                    edge.clear_extent(&halo, [0.0; 4]);
                }
            }
        }
        self.read = 0;
    }

    /// Check that a pass's bound images match the buffer size.
    pub fn check_binding(&self, pass: &'static str, role: ResourceRole, image: &Image) -> LicResult<()> {
        if image.dims() != self.dims {
            return Err(LicError::resource(
                pass,
                format!(
                    "{role} is {}x{}, render target is {}x{}",
                    image.dims()[0],
                    image.dims()[1],
                    self.dims[0],
                    self.dims[1]
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LIC_CLEAR, PingPongBuffers, ResourceRole};
    use crate::error::LicError;
    use crate::extent::PixelExtent;
    use crate::image::Image;

    #[test]
    fn split_reads_last_written_pair() {
        let mut bufs = PingPongBuffers::new([4, 4], false);
        {
            let (_, write) = bufs.split();
            write.lic.set_pixel(1, 1, [7.0, 0.0, 0.0, 1.0]);
        }
        assert_eq!(bufs.current_lic().pixel(1, 1), LIC_CLEAR);
        bufs.swap();
        assert_eq!(bufs.current_lic_role(), ResourceRole::LicB);
        let (read, _) = bufs.split();
        assert_eq!(read.lic.pixel(1, 1), [7.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn binding_slots_are_distinct() {
        let mut slots: Vec<usize> = ResourceRole::ALL.iter().map(|r| r.binding_slot()).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), ResourceRole::ALL.len());
    }

    #[test]
    fn mismatched_binding_is_a_resource_error() {
        let bufs = PingPongBuffers::new([4, 4], false);
        let err = bufs
            .check_binding("LIC0", ResourceRole::Vector, &Image::new([3, 4]))
            .unwrap_err();
        assert!(matches!(err, LicError::Resource { pass: "LIC0", .. }), "{err}");
        let mut bufs = bufs;
        assert!(bufs.edge_with_current().is_err());
    }

    #[test]
    fn clear_resets_halo_and_read_index() {
        let mut bufs = PingPongBuffers::new([16, 16], true);
        bufs.swap();
        bufs.clear(&[PixelExtent::new(6, 7, 6, 7)], true);
        assert_eq!(bufs.read_index(), 0);
        assert_eq!(bufs.current_lic().pixel(2, 2), LIC_CLEAR);
    }
}
