//! Render a WhatsApp pairing QR payload into a PNG data URL.

use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{GrayImage, Luma};

/// Pixels per QR module.
const MODULE_SCALE: u32 = 8;
/// Quiet-zone width in modules on each side.
const QUIET_ZONE: u32 = 4;

/// Encode `payload` as a QR code and return it as a
/// `data:image/png;base64,...` URL suitable for embedding in a JSON response.
pub fn png_data_url(payload: &str) -> Result<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let code = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("failed to encode QR payload: {err}"))?;

    let modules = code.to_colors();
    let width = code.width();
    let side = (u32::try_from(width)? + 2 * QUIET_ZONE) * MODULE_SCALE;

    let mut img = GrayImage::from_pixel(side, side, Luma([0xFF]));
    for (idx, module) in modules.iter().enumerate() {
        if *module != qrcode::Color::Dark {
            continue;
        }
        let mx = u32::try_from(idx % width)?;
        let my = u32::try_from(idx / width)?;
        let x0 = (mx + QUIET_ZONE) * MODULE_SCALE;
        let y0 = (my + QUIET_ZONE) * MODULE_SCALE;
        for dy in 0..MODULE_SCALE {
            for dx in 0..MODULE_SCALE {
                img.put_pixel(x0 + dx, y0 + dy, Luma([0x00]));
            }
        }
    }

    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|err| anyhow!("failed to encode QR PNG: {err}"))?;

    Ok(format!("data:image/png;base64,{}", BASE64.encode(&png)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_payload() {
        let err = png_data_url("   ").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn emits_png_data_url() {
        let url = png_data_url("https://example.com/whatsapp-pairing").unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn payload_round_trips_to_valid_png_bytes() {
        let url = png_data_url("2@AbCdEfGh").unwrap();
        let b64 = url.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = BASE64.decode(b64).unwrap();
        // PNG magic
        assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }

    #[test]
    fn image_includes_quiet_zone() {
        let url = png_data_url("x").unwrap();
        let b64 = url.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = BASE64.decode(b64).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        // smallest QR is 21 modules; with the quiet zone the image must be wider
        assert!(img.width() >= (21 + 2 * QUIET_ZONE) * MODULE_SCALE);
        assert_eq!(img.width(), img.height());
    }
}
