use color_eyre::{eyre::eyre, Result};

use super::frame::{Frame, PixelFormat};

/// Convert a frame to packed RGB24 for still-image encoding
pub fn to_rgb(frame: &Frame) -> Result<Vec<u8>> {
    let (width, height) = (frame.width(), frame.height());
    let expected = frame.meta.format.frame_size(width, height);
    if frame.data.len() != expected {
        return Err(eyre!(
            "{:?} frame {}x{} has {} bytes, expected {}",
            frame.meta.format,
            width,
            height,
            frame.data.len(),
            expected
        ));
    }

    match frame.meta.format {
        PixelFormat::I420 => Ok(i420_to_rgb(&frame.data, width as usize, height as usize)),
    }
}

/// BT.601 limited-range YUV 4:2:0 planar to RGB24
fn i420_to_rgb(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let chroma_width = width.div_ceil(2);
    let chroma_size = chroma_width * height.div_ceil(2);
    let (y_plane, rest) = data.split_at(width * height);
    let (u_plane, v_plane) = rest.split_at(chroma_size);

    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in 0..height {
        for col in 0..width {
            let c = (row / 2) * chroma_width + col / 2;
            let y = (y_plane[row * width + col] as i32 - 16).max(0) * 298;
            let u = u_plane[c] as i32 - 128;
            let v = v_plane[c] as i32 - 128;

            let r = (y + 409 * v + 128) >> 8;
            let g = (y - 100 * u - 208 * v + 128) >> 8;
            let b = (y + 516 * u + 128) >> 8;
            rgb.extend_from_slice(&[clamp(r), clamp(g), clamp(b)]);
        }
    }
    rgb
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
