//! Image helpers: type sniffing, HEIC conversion, resampling
//!
//! HEIC/AVIF conversion and resampling shell out to ImageMagick, which
//! keeps the crate free of native image decoders. The `convert` binary
//! is only required when those paths are actually hit.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{BrowseError, Result};

/// Whether data is a HEIC/HEIF/AVIF image, judged by the ISO BMFF
/// `ftyp` box brand.
pub fn is_heic(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    if &data[4..8] != b"ftyp" {
        return false;
    }
    matches!(
        &data[8..12],
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"mif1" | b"msf1" | b"avif"
    )
}

/// Sniff common image formats by magic. Returns the media type, or
/// `None` for non-image content.
pub fn detect_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.starts_with(b"BM") {
        return Some("image/bmp");
    }
    None
}

async fn run_convert(args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
    let mut child = Command::new("convert")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BrowseError::Protocol(format!("failed to run convert: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BrowseError::Protocol("convert stdin unavailable".to_string()))?;
    let input = input.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        // Dropping stdin closes the pipe so convert sees EOF.
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BrowseError::Protocol(format!("convert failed: {e}")))?;
    let _ = writer.await;

    if !output.status.success() {
        return Err(BrowseError::Protocol(format!(
            "convert exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output.stdout)
}

/// Convert HEIC/AVIF data to PNG via ImageMagick.
pub async fn convert_heic_to_png(data: &[u8]) -> Result<Vec<u8>> {
    run_convert(&["heic:-", "png:-"], data).await
}

/// Pixel dimensions of an image, via ImageMagick `identify`.
async fn image_dimensions(data: &[u8]) -> Result<(u32, u32)> {
    let mut child = Command::new("identify")
        .args(["-format", "%w %h", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| BrowseError::Protocol(format!("failed to run identify: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BrowseError::Protocol("identify stdin unavailable".to_string()))?;
    let input = data.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
    });

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BrowseError::Protocol(format!("identify failed: {e}")))?;
    let _ = writer.await;

    let text = String::from_utf8_lossy(&output.stdout);
    let mut parts = text.split_whitespace();
    let width = parts
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| BrowseError::Protocol("identify produced no width".to_string()))?;
    let height = parts
        .next()
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| BrowseError::Protocol("identify produced no height".to_string()))?;
    Ok((width, height))
}

/// Resample an image so neither dimension exceeds `max_dimension`.
///
/// Returns the (possibly unchanged) bytes, the resulting media type,
/// and whether a resample happened. Resampled output is always PNG.
pub async fn resize_image(
    data: &[u8],
    media_type: &str,
    max_dimension: u32,
) -> Result<(Vec<u8>, String, bool)> {
    let (width, height) = image_dimensions(data).await?;
    if width.max(height) <= max_dimension {
        return Ok((data.to_vec(), media_type.to_string(), false));
    }

    let geometry = format!("{max_dimension}x{max_dimension}>");
    let resized = run_convert(&["-", "-resize", &geometry, "png:-"], data).await?;
    Ok((resized, "image/png".to_string(), true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
        let mut data = vec![0, 0, 0, 0x18];
        data.extend_from_slice(b"ftyp");
        data.extend_from_slice(brand);
        data.extend_from_slice(&[0; 8]);
        data
    }

    #[test]
    fn heic_magic_detection() {
        assert!(is_heic(&ftyp(b"heic")));
        assert!(is_heic(&ftyp(b"heix")));
        assert!(is_heic(&ftyp(b"mif1")));
        assert!(is_heic(&ftyp(b"avif")));
        assert!(!is_heic(&ftyp(b"isom")));
        assert!(!is_heic(b"\x89PNG\r\n\x1a\n"));
        assert!(!is_heic(b"short"));
    }

    #[test]
    fn image_type_sniffing() {
        assert_eq!(
            detect_image_type(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]),
            Some("image/png")
        );
        assert_eq!(
            detect_image_type(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]),
            Some("image/jpeg")
        );
        assert_eq!(detect_image_type(b"GIF89a...."), Some("image/gif"));

        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0, 0, 0, 0]);
        webp.extend_from_slice(b"WEBP");
        assert_eq!(detect_image_type(&webp), Some("image/webp"));

        assert_eq!(detect_image_type(b"#!/bin/sh\necho hi"), None);
        assert_eq!(detect_image_type(b"<html></html>"), None);
    }
}
