//! Wire formats of the remote extractor and the camera light device.

use serde::{Deserialize, Serialize};
use crate::core::extractor::Extraction;
use crate::core::types::FaceBox;

/// Body returned by the extractor endpoint. `face` is null when the frame
/// holds no face.
#[derive(Deserialize, Debug, Clone)]
pub struct ExtractResponse {
    pub face: Option<WireFace>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct WireFace {
    pub embedding: Vec<f32>,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub face_box: WireBox,
}

/// Top-left corner plus size, in pixels.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct WireBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<WireBox> for FaceBox {
    fn from(b: WireBox) -> Self {
        FaceBox {
            x1: b.x,
            y1: b.y,
            x2: b.x + b.width.max(0.0),
            y2: b.y + b.height.max(0.0),
        }
    }
}

impl From<WireFace> for Extraction {
    fn from(face: WireFace) -> Self {
        Extraction {
            embedding: face.embedding,
            confidence: face.confidence,
            face_box: face.face_box.into(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    On,
    Off,
}

/// `POST {base_url}/flash`
#[derive(Serialize, Debug, Clone, Copy)]
pub struct FlashRequest {
    pub state: LightState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_face_and_no_face() {
        let body = r#"{"face":{"embedding":[0.1,0.2],"confidence":0.93,"box":{"x":10,"y":20,"width":30,"height":40}}}"#;
        let parsed: ExtractResponse = serde_json::from_str(body).unwrap();
        let extraction: Extraction = parsed.face.unwrap().into();
        assert_eq!(extraction.embedding, vec![0.1, 0.2]);
        assert_eq!(extraction.face_box, FaceBox { x1: 10.0, y1: 20.0, x2: 40.0, y2: 60.0 });

        let empty: ExtractResponse = serde_json::from_str(r#"{"face":null}"#).unwrap();
        assert!(empty.face.is_none());
    }

    #[test]
    fn flash_body_is_lowercase() {
        let body = serde_json::to_string(&FlashRequest { state: LightState::Off }).unwrap();
        assert_eq!(body, r#"{"state":"off"}"#);
    }
}
