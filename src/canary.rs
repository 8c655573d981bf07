// CLASSIFICATION: COMMUNITY
// Filename: canary.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Poison patterns and canary placement.
//!
//! Linear objects (buffers and SVM) get [`POISON_FILL_LENGTH`] bytes of
//! poison after the data, and optionally the same before it. Images are
//! padded per dimension: [`IMAGE_POISON_WIDTH`] extra columns,
//! [`IMAGE_POISON_HEIGHT`] extra rows and [`IMAGE_POISON_DEPTH`] extra
//! planes, except along dimensions of extent 1.

use crate::runtime::{ImageDesc, ImageFormat};

pub const POISON_FILL_LENGTH: usize = 8192;
pub const POISON_FILL: u8 = 0xC2;
pub const POISON_WORD: u32 = u32::from_ne_bytes([POISON_FILL; 4]);
pub const IMAGE_POISON_WIDTH: usize = 16;
pub const IMAGE_POISON_HEIGHT: usize = 16;
pub const IMAGE_POISON_DEPTH: usize = 16;

/// A buffer of `len` poison bytes.
pub fn poison_region(len: usize) -> Vec<u8> {
    vec![POISON_FILL; len]
}

/// Offset of the first byte that is not poison.
///
/// Compares whole words first and only walks bytes inside the first
/// mismatching word.
pub fn first_corrupted_byte(canary: &[u8]) -> Option<usize> {
    let mut words = canary.chunks_exact(4);
    for (i, word) in words.by_ref().enumerate() {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]);
        if value != POISON_WORD {
            let within = word.iter().position(|&b| b != POISON_FILL).unwrap_or(0);
            return Some(i * 4 + within);
        }
    }
    let tail_start = canary.len() - words.remainder().len();
    words
        .remainder()
        .iter()
        .position(|&b| b != POISON_FILL)
        .map(|p| tail_start + p)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CanarySide {
    /// Poison placed before the data.
    Leading,
    /// Poison placed after the data.
    Trailing,
}

/// One contiguous poison range inside a linear allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanaryRegion {
    pub side: CanarySide,
    pub offset: usize,
    pub len: usize,
}

/// Placement of data and poison inside a padded linear allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    pub size: usize,
    pub leading: bool,
}

impl BufferLayout {
    pub fn new(size: usize, leading: bool) -> Self {
        Self { size, leading }
    }

    pub fn data_offset(&self) -> usize {
        if self.leading {
            POISON_FILL_LENGTH
        } else {
            0
        }
    }

    pub fn total_size(&self) -> usize {
        self.data_offset() + self.size + POISON_FILL_LENGTH
    }

    pub fn overhead(&self) -> usize {
        self.total_size() - self.size
    }

    /// Poison ranges, leading first, relative to the allocation start.
    pub fn regions(&self) -> Vec<CanaryRegion> {
        let mut out = Vec::with_capacity(2);
        if self.leading {
            out.push(CanaryRegion {
                side: CanarySide::Leading,
                offset: 0,
                len: POISON_FILL_LENGTH,
            });
        }
        out.push(CanaryRegion {
            side: CanarySide::Trailing,
            offset: self.data_offset() + self.size,
            len: POISON_FILL_LENGTH,
        });
        out
    }

    /// Padded initial contents: poison everywhere, `init` (or zeros) in the data range.
    pub fn initial_contents(&self, init: Option<&[u8]>) -> Vec<u8> {
        let mut bytes = poison_region(self.total_size());
        let data = &mut bytes[self.data_offset()..self.data_offset() + self.size];
        match init {
            Some(src) => {
                let n = src.len().min(self.size);
                data[..n].copy_from_slice(&src[..n]);
                data[n..].fill(0);
            }
            None => data.fill(0),
        }
        bytes
    }
}

/// Distance of a corrupted byte from the data, as shown in reports.
pub fn overflow_distance(region: &CanaryRegion, first_bad: usize) -> usize {
    match region.side {
        CanarySide::Trailing => first_bad + 1,
        CanarySide::Leading => region.len - first_bad,
    }
}

/// Where a corrupted image canary byte sits relative to the data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageCanaryHit {
    /// Past the end of row `y` in slice `z`, `x` columns into the padding.
    Row { x: usize, y: usize, z: usize },
    /// In the trailing rows of slice `z`, `y` rows into the padding.
    Column { y: usize, z: usize },
    /// In the trailing planes, `z` planes into the padding.
    Depth { z: usize },
    /// Offset outside every canary segment.
    Unresolved,
}

/// One rectangular canary block of a padded image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageSegment {
    pub origin: [usize; 3],
    pub region: [usize; 3],
    /// Byte offset of this block inside the flattened canary.
    pub offset: usize,
}

impl ImageSegment {
    pub fn bytes(&self, pixel: usize) -> usize {
        self.region.iter().product::<usize>() * pixel
    }
}

const IMAGE_PADDING: [usize; 3] = [IMAGE_POISON_WIDTH, IMAGE_POISON_HEIGHT, IMAGE_POISON_DEPTH];

/// Data and padded extents of a canaried image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageGeometry {
    /// Padded extents.
    pub lim: [usize; 3],
    /// Data extents.
    pub dat: [usize; 3],
    pub pixel: usize,
}

impl ImageGeometry {
    /// Geometry for an image whose data extents are `desc`'s.
    pub fn from_data(desc: &ImageDesc, format: &ImageFormat) -> Self {
        let dat = desc.extents();
        let mut lim = dat;
        for (d, l) in lim.iter_mut().enumerate() {
            if *l > 1 {
                *l += IMAGE_PADDING[d];
            }
        }
        Self {
            lim,
            dat,
            pixel: format.pixel_size(),
        }
    }

    /// Geometry for an image whose descriptor already includes padding.
    pub fn from_padded(desc: &ImageDesc, format: &ImageFormat) -> Self {
        let lim = desc.extents();
        let mut dat = lim;
        for (d, v) in dat.iter_mut().enumerate() {
            if *v > 1 {
                *v = v.saturating_sub(IMAGE_PADDING[d]).max(1);
            }
        }
        Self {
            lim,
            dat,
            pixel: format.pixel_size(),
        }
    }

    fn padded(&self, d: usize) -> usize {
        if self.lim[d] > 1 {
            IMAGE_PADDING[d]
        } else {
            0
        }
    }

    /// Descriptor for the padded allocation.
    pub fn padded_desc(&self, data_desc: &ImageDesc) -> ImageDesc {
        data_desc.with_extents(self.lim)
    }

    pub fn data_bytes(&self) -> usize {
        self.dat.iter().product::<usize>() * self.pixel
    }

    pub fn total_bytes(&self) -> usize {
        self.lim.iter().product::<usize>() * self.pixel
    }

    /// Canary blocks in flattened order: per data slice, each data row's
    /// trailing columns then the slice's trailing rows; finally the
    /// trailing planes.
    pub fn segments(&self) -> Vec<ImageSegment> {
        let [i_lim, j_lim, _] = self.lim;
        let [i_dat, j_dat, k_dat] = self.dat;
        let (pw, ph, pd) = (self.padded(0), self.padded(1), self.padded(2));
        let mut out = Vec::new();
        let mut offset = 0;
        let mut push = |origin: [usize; 3], region: [usize; 3], out: &mut Vec<ImageSegment>| {
            let seg = ImageSegment { origin, region, offset };
            offset += seg.bytes(self.pixel);
            out.push(seg);
        };
        for k in 0..k_dat {
            if pw > 0 {
                for j in 0..j_dat {
                    push([i_dat, j, k], [pw, 1, 1], &mut out);
                }
            }
            if ph > 0 {
                push([0, j_dat, k], [i_lim, ph, 1], &mut out);
            }
        }
        if pd > 0 {
            push([0, 0, k_dat], [i_lim, j_lim, pd], &mut out);
        }
        out
    }

    /// Length of the flattened canary in bytes.
    pub fn canary_len(&self) -> usize {
        let [i_lim, j_lim, _] = self.lim;
        let [_, j_dat, k_dat] = self.dat;
        let entries = k_dat * j_dat * self.padded(0)
            + k_dat * self.padded(1) * i_lim
            + self.padded(2) * j_lim * i_lim;
        entries * self.pixel
    }

    /// Resolve a byte offset inside the flattened canary.
    ///
    /// Walks the same order as [`segments`](Self::segments); the row
    /// canaries of a slice are matched before its trailing rows, and those
    /// before the trailing planes.
    pub fn locate(&self, first_bad: usize) -> ImageCanaryHit {
        if self.pixel == 0 || first_bad >= self.canary_len() {
            return ImageCanaryHit::Unresolved;
        }
        let idx = first_bad / self.pixel;
        let [i_lim, j_lim, _] = self.lim;
        let [_, j_dat, k_dat] = self.dat;
        let row_pad = self.padded(0);
        let col_block = self.padded(1) * i_lim;
        let mut accum = 0;
        for k in 0..k_dat {
            for j in 0..j_dat {
                accum += row_pad;
                if idx < accum {
                    return ImageCanaryHit::Row {
                        x: idx - (accum - row_pad),
                        y: j,
                        z: k,
                    };
                }
            }
            accum += col_block;
            if idx < accum {
                return ImageCanaryHit::Column {
                    y: (idx - (accum - col_block)) / i_lim,
                    z: k,
                };
            }
        }
        if self.padded(2) > 0 {
            return ImageCanaryHit::Depth {
                z: (idx - accum) / (i_lim * j_lim),
            };
        }
        ImageCanaryHit::Unresolved
    }

    /// Flat byte offset of element `coord` in a tightly packed padded image.
    pub fn element_offset(&self, coord: [usize; 3]) -> usize {
        ((coord[2] * self.lim[1] + coord[1]) * self.lim[0] + coord[0]) * self.pixel
    }

    /// Full padded image contents: poison everywhere except the data
    /// extents, which hold `init` (packed, or with the given pitches) or zeros.
    pub fn initial_contents(&self, init: Option<&[u8]>, row_pitch: usize, slice_pitch: usize) -> Vec<u8> {
        let mut bytes = poison_region(self.total_bytes());
        let row_bytes = self.dat[0] * self.pixel;
        let row_pitch = if row_pitch == 0 { row_bytes } else { row_pitch };
        let slice_pitch = if slice_pitch == 0 {
            row_pitch * self.dat[1]
        } else {
            slice_pitch
        };
        for k in 0..self.dat[2] {
            for j in 0..self.dat[1] {
                let dst = self.element_offset([0, j, k]);
                let dst = &mut bytes[dst..dst + row_bytes];
                let src_at = k * slice_pitch + j * row_pitch;
                match init.and_then(|src| src.get(src_at..src_at + row_bytes)) {
                    Some(src) => dst.copy_from_slice(src),
                    None => dst.fill(0),
                }
            }
        }
        bytes
    }

    /// The flattened canary of a tightly packed padded image.
    pub fn gather_canary(&self, image: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.canary_len());
        for seg in self.segments() {
            append_region(self, image, seg.origin, seg.region, &mut out);
        }
        out
    }
}

/// Append the packed bytes of `region` at `origin` from a padded image.
pub fn append_region(geom: &ImageGeometry, image: &[u8], origin: [usize; 3], region: [usize; 3], out: &mut Vec<u8>) {
    let row = region[0] * geom.pixel;
    for z in 0..region[2] {
        for y in 0..region[1] {
            let at = geom.element_offset([origin[0], origin[1] + y, origin[2] + z]);
            out.extend_from_slice(&image[at..at + row]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ChannelOrder, ChannelType, ImageType};

    fn rgba8() -> ImageFormat {
        ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8)
    }

    #[test]
    fn scan_finds_first_bad_byte_in_word() {
        let mut canary = poison_region(64);
        assert_eq!(first_corrupted_byte(&canary), None);
        canary[10] = 0;
        canary[40] = 0;
        assert_eq!(first_corrupted_byte(&canary), Some(10));
    }

    #[test]
    fn scan_covers_unaligned_tail() {
        let mut canary = poison_region(7);
        canary[6] = 1;
        assert_eq!(first_corrupted_byte(&canary), Some(6));
    }

    #[test]
    fn buffer_layout_with_leading_region() {
        let layout = BufferLayout::new(100, true);
        assert_eq!(layout.data_offset(), POISON_FILL_LENGTH);
        assert_eq!(layout.total_size(), 100 + 2 * POISON_FILL_LENGTH);
        let regions = layout.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].side, CanarySide::Leading);
        assert_eq!(regions[1].offset, POISON_FILL_LENGTH + 100);
    }

    #[test]
    fn buffer_initial_contents_pad_with_poison() {
        let layout = BufferLayout::new(4, false);
        let bytes = layout.initial_contents(Some(&[1, 2]));
        assert_eq!(&bytes[..4], &[1, 2, 0, 0]);
        assert!(bytes[4..].iter().all(|&b| b == POISON_FILL));
    }

    #[test]
    fn distance_from_data() {
        let trailing = CanaryRegion {
            side: CanarySide::Trailing,
            offset: 0,
            len: POISON_FILL_LENGTH,
        };
        assert_eq!(overflow_distance(&trailing, 0), 1);
        let leading = CanaryRegion {
            side: CanarySide::Leading,
            ..trailing
        };
        assert_eq!(overflow_distance(&leading, POISON_FILL_LENGTH - 1), 1);
    }

    #[test]
    fn image_2d_padding_and_canary_length() {
        let geom = ImageGeometry::from_data(&ImageDesc::image_2d(8, 4), &rgba8());
        assert_eq!(geom.lim, [24, 20, 1]);
        // 4 rows * 16 trailing columns + 16 trailing rows of 24
        assert_eq!(geom.canary_len(), (4 * 16 + 16 * 24) * 4);
        let total: usize = geom.segments().iter().map(|s| s.bytes(4)).sum();
        assert_eq!(total, geom.canary_len());
    }

    #[test]
    fn unpadded_dimensions_have_no_segments() {
        let geom = ImageGeometry::from_data(&ImageDesc::new(ImageType::Image1D, 32, 1, 1, 1), &rgba8());
        assert_eq!(geom.lim, [48, 1, 1]);
        let segs = geom.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].origin, [32, 0, 0]);
        assert_eq!(geom.canary_len(), 16 * 4);
    }

    #[test]
    fn padded_descriptor_round_trip() {
        let data = ImageDesc::image_3d(8, 4, 2);
        let geom = ImageGeometry::from_data(&data, &rgba8());
        let padded = geom.padded_desc(&data);
        assert_eq!((padded.width, padded.height, padded.depth), (24, 20, 18));
        assert_eq!(ImageGeometry::from_padded(&padded, &rgba8()), geom);
    }

    #[test]
    fn locate_prefers_row_canary() {
        let geom = ImageGeometry::from_data(&ImageDesc::image_2d(8, 4), &rgba8());
        assert_eq!(geom.locate(0), ImageCanaryHit::Row { x: 0, y: 0, z: 0 });
        assert_eq!(geom.locate(17 * 4), ImageCanaryHit::Row { x: 1, y: 1, z: 0 });
        let first_column = 4 * 16 * 4;
        assert_eq!(geom.locate(first_column), ImageCanaryHit::Column { y: 0, z: 0 });
        assert_eq!(geom.locate(first_column + 24 * 4 * 3), ImageCanaryHit::Column { y: 3, z: 0 });
    }

    #[test]
    fn locate_reaches_depth_planes() {
        let geom = ImageGeometry::from_data(&ImageDesc::image_3d(8, 4, 2), &rgba8());
        let slices = 2 * (4 * 16 + 16 * 24) * 4;
        assert_eq!(geom.locate(slices - 1), ImageCanaryHit::Column { y: 15, z: 1 });
        assert_eq!(geom.locate(slices), ImageCanaryHit::Depth { z: 0 });
        assert_eq!(geom.locate(slices + 24 * 20 * 4 * 2), ImageCanaryHit::Depth { z: 2 });
        assert_eq!(geom.locate(geom.canary_len()), ImageCanaryHit::Unresolved);
    }

    #[test]
    fn locate_agrees_with_segment_origins() {
        let geom = ImageGeometry::from_data(&ImageDesc::image_3d(5, 3, 2), &rgba8());
        for seg in geom.segments() {
            match geom.locate(seg.offset) {
                ImageCanaryHit::Row { x, y, z } => {
                    assert_eq!([geom.dat[0] + x, y, z], seg.origin)
                }
                ImageCanaryHit::Column { y, z } => assert_eq!([0, geom.dat[1] + y, z], seg.origin),
                ImageCanaryHit::Depth { z } => assert_eq!([0, 0, geom.dat[2] + z], seg.origin),
                ImageCanaryHit::Unresolved => panic!("segment at {} unresolved", seg.offset),
            }
        }
    }

    #[test]
    fn gathered_canary_is_pure_poison_until_written() {
        let geom = ImageGeometry::from_data(&ImageDesc::image_2d(8, 4), &rgba8());
        let mut image = geom.initial_contents(Some(&[7u8; 8 * 4 * 4]), 0, 0);
        assert_eq!(first_corrupted_byte(&geom.gather_canary(&image)), None);
        let at = geom.element_offset([8, 2, 0]);
        image[at] = 0;
        let canary = geom.gather_canary(&image);
        let bad = first_corrupted_byte(&canary).unwrap();
        assert_eq!(geom.locate(bad), ImageCanaryHit::Row { x: 0, y: 2, z: 0 });
    }
}
