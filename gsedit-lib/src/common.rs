pub const ZSTD_MAX_COMPRESSION_LVL: u32 = 22;

/// Zeroth-order spherical harmonics basis constant.
pub const SH_C0: f32 = 0.282_094_8;

/// Opacity given to freshly initialized gaussians, before the logit.
pub const INITIAL_OPACITY: f32 = 0.1;

pub const MAX_SH_DEGREE: u32 = 3;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn inv_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

#[inline]
pub fn rgb_to_sh_dc(rgb: f32) -> f32 {
    (rgb - 0.5) / SH_C0
}

#[inline]
pub fn sh_dc_to_rgb(dc: f32) -> f32 {
    dc * SH_C0 + 0.5
}

/// Higher-order SH coefficients per color channel for a degree.
#[inline]
pub fn dim_for_degree(deg: u32) -> usize {
    match deg {
        0 => 0,
        1 => 3,
        2 => 8,
        3 => 15,
        _ => 15,
    }
}

#[inline]
pub(crate) const fn degree_for_dim(dim: usize) -> u32 {
    if dim < 3 {
        0
    } else if dim < 8 {
        1
    } else if dim < 15 {
        2
    } else {
        3
    }
}

#[inline]
pub(crate) fn clamp_u8(x: f32) -> u8 {
    x.round().clamp(0.0, 255.0) as u8
}

/// Keeps the rows of a flat, row-major array whose `keep` flag is set.
/// Arrays whose length is not `keep.len() * stride` are left untouched;
/// returns whether the array was filtered.
pub(crate) fn retain_rows<T: Copy>(data: &mut Vec<T>, stride: usize, keep: &[bool]) -> bool {
    if data.len() != keep.len() * stride {
        return false;
    }
    if stride == 0 {
        return true;
    }
    let mut write = 0;
    for (row, &k) in keep.iter().enumerate() {
        if k {
            if write != row {
                data.copy_within(row * stride..(row + 1) * stride, write * stride);
            }
            write += 1;
        }
    }
    data.truncate(write * stride);
    true
}
