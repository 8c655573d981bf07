// CLASSIFICATION: COMMUNITY
// Filename: image.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Image formats and descriptors, mirroring `cl_image_format` and
//! `cl_image_desc`.

/// Channel layout of an image element.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R = 0x10B0,
    A = 0x10B1,
    Rg = 0x10B2,
    Ra = 0x10B3,
    Rgb = 0x10B4,
    Rgba = 0x10B5,
    Bgra = 0x10B6,
    Argb = 0x10B7,
    Intensity = 0x10B8,
    Luminance = 0x10B9,
    Rx = 0x10BA,
    Rgx = 0x10BB,
    Rgbx = 0x10BC,
    Depth = 0x10BD,
    DepthStencil = 0x10BE,
    Srgb = 0x10BF,
    Srgbx = 0x10C0,
    Srgba = 0x10C1,
    Sbgra = 0x10C2,
    Abgr = 0x10C3,
}

impl ChannelOrder {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use ChannelOrder::*;
        Some(match raw {
            0x10B0 => R,
            0x10B1 => A,
            0x10B2 => Rg,
            0x10B3 => Ra,
            0x10B4 => Rgb,
            0x10B5 => Rgba,
            0x10B6 => Bgra,
            0x10B7 => Argb,
            0x10B8 => Intensity,
            0x10B9 => Luminance,
            0x10BA => Rx,
            0x10BB => Rgx,
            0x10BC => Rgbx,
            0x10BD => Depth,
            0x10BE => DepthStencil,
            0x10BF => Srgb,
            0x10C0 => Srgbx,
            0x10C1 => Srgba,
            0x10C2 => Sbgra,
            0x10C3 => Abgr,
            _ => return None,
        })
    }

    /// Channel count used for element sizing.
    ///
    /// The three-channel orders only pair with packed channel types, whose
    /// size already covers every channel, so they count as one.
    pub fn channels(self) -> usize {
        use ChannelOrder::*;
        match self {
            R | A | Intensity | Luminance | Rx | Depth | DepthStencil => 1,
            Rg | Ra | Rgx => 2,
            Rgb | Srgb => 1,
            Rgba | Bgra | Argb | Rgbx | Srgbx | Srgba | Sbgra | Abgr => 4,
        }
    }
}

/// Storage type of one channel.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelType {
    SnormInt8 = 0x10D0,
    SnormInt16 = 0x10D1,
    UnormInt8 = 0x10D2,
    UnormInt16 = 0x10D3,
    UnormShort565 = 0x10D4,
    UnormShort555 = 0x10D5,
    UnormInt101010 = 0x10D6,
    SignedInt8 = 0x10D7,
    SignedInt16 = 0x10D8,
    SignedInt32 = 0x10D9,
    UnsignedInt8 = 0x10DA,
    UnsignedInt16 = 0x10DB,
    UnsignedInt32 = 0x10DC,
    HalfFloat = 0x10DD,
    Float = 0x10DE,
    UnormInt24 = 0x10DF,
}

impl ChannelType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use ChannelType::*;
        Some(match raw {
            0x10D0 => SnormInt8,
            0x10D1 => SnormInt16,
            0x10D2 => UnormInt8,
            0x10D3 => UnormInt16,
            0x10D4 => UnormShort565,
            0x10D5 => UnormShort555,
            0x10D6 => UnormInt101010,
            0x10D7 => SignedInt8,
            0x10D8 => SignedInt16,
            0x10D9 => SignedInt32,
            0x10DA => UnsignedInt8,
            0x10DB => UnsignedInt16,
            0x10DC => UnsignedInt32,
            0x10DD => HalfFloat,
            0x10DE => Float,
            0x10DF => UnormInt24,
            _ => return None,
        })
    }

    pub fn bytes(self) -> usize {
        use ChannelType::*;
        match self {
            SnormInt8 | UnormInt8 | SignedInt8 | UnsignedInt8 => 1,
            SnormInt16 | UnormInt16 | SignedInt16 | UnsignedInt16 | HalfFloat => 2,
            UnormShort565 | UnormShort555 => 2,
            UnormInt101010 | SignedInt32 | UnsignedInt32 | Float | UnormInt24 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub channel_type: ChannelType,
}

impl ImageFormat {
    pub fn new(order: ChannelOrder, channel_type: ChannelType) -> Self {
        Self { order, channel_type }
    }

    /// Bytes per image element.
    pub fn pixel_size(&self) -> usize {
        self.order.channels() * self.channel_type.bytes()
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageType {
    Image2D = 0x10F1,
    Image3D = 0x10F2,
    Image2DArray = 0x10F3,
    Image1D = 0x10F4,
    Image1DArray = 0x10F5,
    Image1DBuffer = 0x10F6,
}

impl ImageType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use ImageType::*;
        Some(match raw {
            0x10F1 => Image2D,
            0x10F2 => Image3D,
            0x10F3 => Image2DArray,
            0x10F4 => Image1D,
            0x10F5 => Image1DArray,
            0x10F6 => Image1DBuffer,
            _ => return None,
        })
    }
}

/// Image shape. Unused dimensions hold 1 so extents can be multiplied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub image_type: ImageType,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub array_size: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

impl ImageDesc {
    pub fn image_2d(width: usize, height: usize) -> Self {
        Self::new(ImageType::Image2D, width, height, 1, 1)
    }

    pub fn image_3d(width: usize, height: usize, depth: usize) -> Self {
        Self::new(ImageType::Image3D, width, height, depth, 1)
    }

    pub fn new(image_type: ImageType, width: usize, height: usize, depth: usize, array_size: usize) -> Self {
        Self {
            image_type,
            width,
            height,
            depth,
            array_size,
            row_pitch: 0,
            slice_pitch: 0,
        }
        .normalized()
    }

    /// Force the dimensions an image type does not use to 1.
    pub fn normalized(mut self) -> Self {
        match self.image_type {
            ImageType::Image1D | ImageType::Image1DBuffer => {
                self.height = 1;
                self.depth = 1;
                self.array_size = 1;
            }
            ImageType::Image1DArray => {
                self.height = 1;
                self.depth = 1;
            }
            ImageType::Image2D => {
                self.depth = 1;
                self.array_size = 1;
            }
            ImageType::Image2DArray => self.depth = 1,
            ImageType::Image3D => self.array_size = 1,
        }
        self.width = self.width.max(1);
        self.height = self.height.max(1);
        self.depth = self.depth.max(1);
        self.array_size = self.array_size.max(1);
        self
    }

    /// Addressable extents `[x, y, z]`; array layers take the next free axis.
    pub fn extents(&self) -> [usize; 3] {
        match self.image_type {
            ImageType::Image1DArray => [self.width, self.array_size, 1],
            ImageType::Image2DArray => [self.width, self.height, self.array_size],
            _ => [self.width, self.height, self.depth],
        }
    }

    /// Same image type with new addressable extents.
    pub fn with_extents(&self, ext: [usize; 3]) -> Self {
        let mut out = *self;
        out.width = ext[0];
        match self.image_type {
            ImageType::Image1DArray => out.array_size = ext[1],
            ImageType::Image2DArray => {
                out.height = ext[1];
                out.array_size = ext[2];
            }
            _ => {
                out.height = ext[1];
                out.depth = ext[2];
            }
        }
        out.row_pitch = 0;
        out.slice_pitch = 0;
        out.normalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_sizes() {
        let rgba8 = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8);
        assert_eq!(rgba8.pixel_size(), 4);
        let rf = ImageFormat::new(ChannelOrder::R, ChannelType::Float);
        assert_eq!(rf.pixel_size(), 4);
        let rgb565 = ImageFormat::new(ChannelOrder::Rgb, ChannelType::UnormShort565);
        assert_eq!(rgb565.pixel_size(), 2);
        let rg16 = ImageFormat::new(ChannelOrder::Rg, ChannelType::HalfFloat);
        assert_eq!(rg16.pixel_size(), 4);
    }

    #[test]
    fn array_layers_map_to_next_axis() {
        let a1 = ImageDesc::new(ImageType::Image1DArray, 64, 9, 9, 5);
        assert_eq!(a1.extents(), [64, 5, 1]);
        let a2 = ImageDesc::new(ImageType::Image2DArray, 8, 4, 9, 3);
        assert_eq!(a2.extents(), [8, 4, 3]);
        assert_eq!(a2.with_extents([24, 20, 19]).array_size, 19);
    }

    #[test]
    fn raw_codes_round_trip() {
        assert_eq!(ChannelOrder::from_raw(ChannelOrder::Bgra as u32), Some(ChannelOrder::Bgra));
        assert_eq!(ChannelType::from_raw(0x10DE), Some(ChannelType::Float));
        assert_eq!(ImageType::from_raw(0x10F2), Some(ImageType::Image3D));
        assert_eq!(ImageType::from_raw(0x10F0), None);
    }
}
