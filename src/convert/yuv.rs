//! BT.601 YUV 4:2:0 → RGBA/BGRA and luma conversion on the CPU

use crate::capture::frame::{ColorOrder, Plane, Resolution};
use crate::error::ConvertError;

/// Limited-range BT.601 in 8.8 fixed point, matching the GPU kernel
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (i32::from(y) - 16);
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let r = (c + 409 * e + 128) >> 8;
    let g = (c - 100 * d - 208 * e + 128) >> 8;
    let b = (c + 516 * d + 128) >> 8;
    [r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]
}

#[inline]
fn store(px: &mut [u8], [r, g, b]: [u8; 3], order: ColorOrder) {
    match order {
        ColorOrder::Rgba => px.copy_from_slice(&[r, g, b, 255]),
        ColorOrder::Bgra => px.copy_from_slice(&[b, g, r, 255]),
    }
}

/// Chroma plane dimensions for a 4:2:0 frame
pub fn chroma_dims(resolution: Resolution) -> (usize, usize) {
    (
        resolution.width.div_ceil(2) as usize,
        resolution.height.div_ceil(2) as usize,
    )
}

/// Size of a contiguous I420 buffer
pub fn i420_len(resolution: Resolution) -> usize {
    let (cw, ch) = chroma_dims(resolution);
    resolution.pixel_count() + 2 * cw * ch
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), ConvertError> {
    if actual < expected {
        return Err(ConvertError::BufferSize {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_nonempty(resolution: Resolution) -> Result<(), ConvertError> {
    if resolution.is_empty() {
        return Err(ConvertError::EmptyFrame(resolution));
    }
    Ok(())
}

fn check_exact(what: &'static str, expected: usize, actual: usize) -> Result<(), ConvertError> {
    if actual != expected {
        return Err(ConvertError::BufferSize {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Bytes a strided plane must hold for `rows` rows of `cols` samples
fn strided_len(plane: &Plane, cols: usize, rows: usize) -> usize {
    if rows == 0 || cols == 0 {
        return 0;
    }
    (rows - 1) * plane.row_stride + (cols - 1) * plane.pixel_stride + 1
}

/// Copy a plane with `row_stride` padding into `out`, one row at a time
fn copy_plane(
    what: &'static str,
    plane: &Plane,
    cols: usize,
    rows: usize,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    check_len(what, strided_len(plane, cols, rows), plane.data.len())?;
    if plane.pixel_stride == 1 && plane.row_stride == cols {
        out.extend_from_slice(&plane.data[..cols * rows]);
        return Ok(());
    }
    for row in 0..rows {
        let start = row * plane.row_stride;
        if plane.pixel_stride == 1 {
            out.extend_from_slice(&plane.data[start..start + cols]);
        } else {
            out.extend((0..cols).map(|col| plane.data[start + col * plane.pixel_stride]));
        }
    }
    Ok(())
}

/// Repack a frame whose planes may carry row padding into contiguous I420
/// (Y, then U, then V). Interleaved chroma (pixel stride 2) is split out as
/// well. `out` is cleared first.
pub fn repack_planar(
    planes: &[Plane; 3],
    resolution: Resolution,
    out: &mut Vec<u8>,
) -> Result<(), ConvertError> {
    check_nonempty(resolution)?;
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let (cw, ch) = chroma_dims(resolution);
    out.clear();
    copy_plane("luma", &planes[0], w, h, out)?;
    copy_plane("u", &planes[1], cw, ch, out)?;
    copy_plane("v", &planes[2], cw, ch, out)?;
    Ok(())
}

/// Convert contiguous I420 into `rgba` (w·h·4 bytes)
pub fn i420_to_rgba(
    yuv: &[u8],
    resolution: Resolution,
    order: ColorOrder,
    rgba: &mut [u8],
) -> Result<(), ConvertError> {
    check_nonempty(resolution)?;
    check_len("yuv", i420_len(resolution), yuv.len())?;
    check_exact("rgba", resolution.rgba_len(), rgba.len())?;

    let w = resolution.width as usize;
    let (cw, ch) = chroma_dims(resolution);
    let (luma, chroma) = yuv.split_at(resolution.pixel_count());
    let (u_plane, v_plane) = chroma.split_at(cw * ch);

    for (row, out_row) in rgba.chunks_exact_mut(w * 4).enumerate() {
        let y_row = &luma[row * w..(row + 1) * w];
        let c_row = (row / 2) * cw;
        for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
            let c = c_row + col / 2;
            store(px, yuv_to_rgb(y_row[col], u_plane[c], v_plane[c]), order);
        }
    }
    Ok(())
}

/// Luma of a contiguous I420 frame into `grey` (w·h bytes)
pub fn i420_to_grey(yuv: &[u8], resolution: Resolution, grey: &mut [u8]) -> Result<(), ConvertError> {
    check_len("yuv", resolution.pixel_count(), yuv.len())?;
    check_exact("grey", resolution.pixel_count(), grey.len())?;
    grey.copy_from_slice(&yuv[..resolution.pixel_count()]);
    Ok(())
}

/// Convert a semi-planar frame straight from its planes.
///
/// Chroma samples are addressed through each plane's row and pixel stride,
/// so NV12 and NV21 views (pixel stride 2) need no repacking.
pub fn semi_planar_to_rgba(
    planes: &[Plane; 3],
    resolution: Resolution,
    order: ColorOrder,
    rgba: &mut [u8],
    grey: Option<&mut [u8]>,
) -> Result<(), ConvertError> {
    check_nonempty(resolution)?;
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let (cw, ch) = chroma_dims(resolution);
    let [y_plane, u_plane, v_plane] = planes;
    check_len("luma", strided_len(y_plane, w, h), y_plane.data.len())?;
    check_len("u", strided_len(u_plane, cw, ch), u_plane.data.len())?;
    check_len("v", strided_len(v_plane, cw, ch), v_plane.data.len())?;
    check_exact("rgba", resolution.rgba_len(), rgba.len())?;

    for (row, out_row) in rgba.chunks_exact_mut(w * 4).enumerate() {
        let y_start = row * y_plane.row_stride;
        let u_start = (row / 2) * u_plane.row_stride;
        let v_start = (row / 2) * v_plane.row_stride;
        for (col, px) in out_row.chunks_exact_mut(4).enumerate() {
            let y = y_plane.data[y_start + col * y_plane.pixel_stride];
            let u = u_plane.data[u_start + (col / 2) * u_plane.pixel_stride];
            let v = v_plane.data[v_start + (col / 2) * v_plane.pixel_stride];
            store(px, yuv_to_rgb(y, u, v), order);
        }
    }

    if let Some(grey) = grey {
        check_exact("grey", resolution.pixel_count(), grey.len())?;
        for (row, out_row) in grey.chunks_exact_mut(w).enumerate() {
            let y_start = row * y_plane.row_stride;
            for (col, g) in out_row.iter_mut().enumerate() {
                *g = y_plane.data[y_start + col * y_plane.pixel_stride];
            }
        }
    }
    Ok(())
}
