// WhatsApp Connection Manager — QR Renderer
// encode, render (with raw-payload fallback)
//
// Codes are rendered as SVG at error-correction level H: phones scanning a
// code off a laptop screen through glare need the redundancy.

use crate::atoms::constants::QR_DATA_URI_PREFIX;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::QrData;
use base64::Engine as _;
use log::{info, warn};
use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};

/// Encode a pairing payload as an SVG data URI.
pub fn encode(payload: &str, min_dimension: u32) -> EngineResult<String> {
    if payload.is_empty() {
        return Err(EngineError::encoding("empty pairing payload"));
    }
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)
        .map_err(|e| EngineError::encoding(format!("QR encode failed: {}", e)))?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(min_dimension, min_dimension)
        .quiet_zone(true)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    let encoded = base64::engine::general_purpose::STANDARD.encode(image.as_bytes());
    Ok(format!("{}{}", QR_DATA_URI_PREFIX, encoded))
}

/// Encode off the async runtime; on any failure hand back the raw payload so
/// the caller can still show something. The error (if any) is returned
/// alongside for the caller to record.
pub async fn render(payload: String, min_dimension: u32) -> (QrData, Option<EngineError>) {
    let input = payload.clone();
    let result = tokio::task::spawn_blocking(move || encode(&input, min_dimension))
        .await
        .unwrap_or_else(|e| Err(EngineError::encoding(format!("QR encoder task failed: {}", e))));

    match result {
        Ok(uri) => {
            info!("[whatsapp] QR code rendered ({} bytes)", uri.len());
            (QrData::Image(uri), None)
        }
        Err(e) => {
            warn!("[whatsapp] {}; falling back to raw payload", e);
            (QrData::Raw(payload), Some(e))
        }
    }
}
