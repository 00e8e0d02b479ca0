//! Ephemeral awareness state: who is in a room and where their cursor is.
//! Nothing in here is persisted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor of a session, in the coordinate space of the document kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Cursor {
    /// Caret or selection in a text document; `anchor == head` is a caret.
    Text { anchor: u32, head: u32 },
    /// Pointer position on a canvas
    Pointer { x: f64, y: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub session_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub cursor: Option<Cursor>,
}

impl Presence {
    pub fn new(session_id: Uuid, user_id: &str, display_name: &str) -> Self {
        Self {
            session_id,
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            color: color_for(user_id),
            cursor: None,
        }
    }
}

/// Stable, visually distinct colour for a user, so one person keeps the same
/// colour across tabs and reconnects.
pub fn color_for(user_id: &str) -> String {
    // FNV-1a, stable across builds
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!("#{:02x}{:02x}{:02x}", to_byte(r), to_byte(g), to_byte(b))
}

fn to_byte(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_is_stable_per_user() {
        assert_eq!(color_for("alice"), color_for("alice"));
        assert_eq!(color_for("alice").len(), 7);
        assert!(color_for("alice").starts_with('#'));
    }

    #[test]
    fn cursor_wire_shape() {
        let cursor = Cursor::Text { anchor: 3, head: 7 };
        let json = serde_json::to_value(&cursor).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["anchor"], 3);

        let pointer: Cursor = serde_json::from_str(r#"{"type":"pointer","x":1.5,"y":2.0}"#).unwrap();
        assert_eq!(pointer, Cursor::Pointer { x: 1.5, y: 2.0 });
    }
}
