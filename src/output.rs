use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::hdr::HdrEncoder;
use image::Rgb;

use crate::shader_interface::CHANNELS_PER_PIXEL;

/// Writes the readback buffer as a Radiance HDR file; the data stays linear
/// float, exactly as the compute program produced it.
pub fn write_hdr(
    path: impl AsRef<Path>,
    width: u32,
    height: u32,
    pixels: &[f32],
) -> anyhow::Result<()> {
    anyhow::ensure!(
        pixels.len() == width as usize * height as usize * CHANNELS_PER_PIXEL,
        "pixel buffer does not match {width}x{height}"
    );

    let rgb: Vec<Rgb<f32>> = pixels
        .chunks_exact(CHANNELS_PER_PIXEL)
        .map(|pixel| Rgb([pixel[0], pixel[1], pixel[2]]))
        .collect();

    let file = File::create(path)?;
    HdrEncoder::new(BufWriter::new(file)).encode(&rgb, width as usize, height as usize)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_tiny_image() {
        let path = std::env::temp_dir().join("raybake_output_test.hdr");
        let pixels = vec![0.0, 0.5, 1.0, 2.0, 0.25, 0.0];
        write_hdr(&path, 2, 1, &pixels).unwrap();

        let written = std::fs::metadata(&path).unwrap().len();
        assert!(written > 0);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let path = std::env::temp_dir().join("raybake_output_mismatch.hdr");
        assert!(write_hdr(&path, 2, 2, &[0.0; 6]).is_err());
    }
}
