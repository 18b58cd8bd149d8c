//! Format aliasing rules
//!
//! Two formats may share memory through an aliased image only when they
//! belong to the same family with identical bit depth, compression and
//! sRGB encoding. Depth formats never alias.

use ash::vk;

/// Group of formats with the same memory layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatFamily {
    /// One 8-bit channel
    R8,
    /// Two 8-bit channels
    Rg8,
    /// Four 8-bit channels, RGBA order
    Rgba8,
    /// Four 8-bit channels, BGRA order
    Bgra8,
    /// Four 16-bit float channels
    Rgba16Float,
    /// Four 32-bit float channels
    Rgba32Float,
    /// 16-bit depth
    Depth16,
    /// 24-bit depth with 8-bit stencil
    Depth24,
    /// 32-bit float depth
    Depth32,
    /// BC1 block compression
    Bc1,
}

/// Layout facts about a format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescription {
    /// Layout family
    pub family: FormatFamily,
    /// Bits per texel, or per block for compressed formats
    pub bit_depth: u32,
    /// sRGB encoded
    pub srgb: bool,
    /// Block compressed
    pub compressed: bool,
    /// Depth or depth/stencil
    pub depth: bool,
}

impl FormatDescription {
    const fn color(family: FormatFamily, bit_depth: u32, srgb: bool) -> Self {
        Self {
            family,
            bit_depth,
            srgb,
            compressed: false,
            depth: false,
        }
    }

    const fn depth(family: FormatFamily, bit_depth: u32) -> Self {
        Self {
            family,
            bit_depth,
            srgb: false,
            compressed: false,
            depth: true,
        }
    }

    const fn block(family: FormatFamily, bit_depth: u32, srgb: bool) -> Self {
        Self {
            family,
            bit_depth,
            srgb,
            compressed: true,
            depth: false,
        }
    }
}

/// Describe a format, `None` if it is not in the aliasing table
pub fn describe(format: vk::Format) -> Option<FormatDescription> {
    use FormatFamily as F;

    let description = match format {
        vk::Format::R8_UNORM => FormatDescription::color(F::R8, 8, false),
        vk::Format::R8_SRGB => FormatDescription::color(F::R8, 8, true),
        vk::Format::R8G8_UNORM => FormatDescription::color(F::Rg8, 16, false),
        vk::Format::R8G8_SRGB => FormatDescription::color(F::Rg8, 16, true),
        vk::Format::R8G8B8A8_UNORM => FormatDescription::color(F::Rgba8, 32, false),
        vk::Format::R8G8B8A8_SRGB => FormatDescription::color(F::Rgba8, 32, true),
        vk::Format::B8G8R8A8_UNORM => FormatDescription::color(F::Bgra8, 32, false),
        vk::Format::B8G8R8A8_SRGB => FormatDescription::color(F::Bgra8, 32, true),
        vk::Format::R16G16B16A16_SFLOAT => FormatDescription::color(F::Rgba16Float, 64, false),
        vk::Format::R32G32B32A32_SFLOAT => FormatDescription::color(F::Rgba32Float, 128, false),
        vk::Format::D16_UNORM => FormatDescription::depth(F::Depth16, 16),
        vk::Format::D24_UNORM_S8_UINT => FormatDescription::depth(F::Depth24, 32),
        vk::Format::D32_SFLOAT => FormatDescription::depth(F::Depth32, 32),
        vk::Format::BC1_RGBA_UNORM_BLOCK => FormatDescription::block(F::Bc1, 64, false),
        vk::Format::BC1_RGBA_SRGB_BLOCK => FormatDescription::block(F::Bc1, 64, true),
        _ => return None,
    };

    Some(description)
}

/// Whether an image of `dst` may alias memory laid out as `src`
///
/// Only the layout table is consulted; backends additionally check the
/// device's format features.
pub fn is_aliasing_compatible(src: vk::Format, dst: vk::Format) -> bool {
    let (Some(src), Some(dst)) = (describe(src), describe(dst)) else {
        return false;
    };

    src.family == dst.family
        && src.bit_depth == dst.bit_depth
        && src.compressed == dst.compressed
        && src.srgb == dst.srgb
        && !src.depth
}

/// Bytes of tightly packed data for an image of `format` and `extent`
///
/// Compressed formats are measured in 4x4 blocks.
pub fn image_data_size(format: vk::Format, extent: vk::Extent3D) -> Option<u64> {
    let description = describe(format)?;
    let unit_bytes = u64::from(description.bit_depth / 8);

    let (columns, rows) = if description.compressed {
        (u64::from(extent.width.div_ceil(4)), u64::from(extent.height.div_ceil(4)))
    } else {
        (u64::from(extent.width), u64::from(extent.height))
    };

    columns
        .checked_mul(rows)?
        .checked_mul(u64::from(extent.depth))?
        .checked_mul(unit_bytes)
}
