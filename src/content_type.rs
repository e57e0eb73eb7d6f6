//! Media content-type classification (C9).
//!
//! Classification is exact-subtype matching, never substring matching, so a
//! header like `text/html; image/png` (a client or origin trying to smuggle a
//! trusted-looking suffix past a naive `contains("image")` check) is correctly
//! rejected as HTML, not accepted as an image.

const IMAGE_SUBTYPES: &[&str] = &[
    "jpeg", "jpg", "png", "gif", "webp", "avif", "svg+xml", "bmp", "tiff", "x-icon", "heic",
    "heif", "jxl",
];

const VIDEO_SUBTYPES: &[&str] = &[
    "mp4",
    "webm",
    "ogg",
    "quicktime",
    "x-matroska",
    "x-m4v",
    "mp2t",
];

const AUDIO_SUBTYPES: &[&str] = &[
    "mpeg", "ogg", "wav", "webm", "x-m4a", "mp4", "aac", "flac",
];

const HLS_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// A content-type split into its lowercased, trimmed `type` and `subtype`,
/// with any `;`-delimited parameters (e.g. `; charset=utf-8`) discarded.
struct MimeEssence {
    kind: String,
    subtype: String,
}

fn parse_mime(content_type: &str) -> Option<MimeEssence> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let (kind, subtype) = essence.split_once('/')?;
    Some(MimeEssence {
        kind: kind.to_string(),
        subtype: subtype.to_string(),
    })
}

pub fn is_image(content_type: &str) -> bool {
    match parse_mime(content_type) {
        Some(m) => m.kind == "image" && IMAGE_SUBTYPES.contains(&m.subtype.as_str()),
        None => false,
    }
}

pub fn is_video(content_type: &str) -> bool {
    match parse_mime(content_type) {
        Some(m) => m.kind == "video" && VIDEO_SUBTYPES.contains(&m.subtype.as_str()),
        None => false,
    }
}

pub fn is_audio(content_type: &str) -> bool {
    match parse_mime(content_type) {
        Some(m) => m.kind == "audio" && AUDIO_SUBTYPES.contains(&m.subtype.as_str()),
        None => false,
    }
}

pub fn is_hls(content_type: &str) -> bool {
    match content_type.split(';').next() {
        Some(essence) => HLS_TYPES.contains(&essence.trim().to_ascii_lowercase().as_str()),
        None => false,
    }
}

pub fn is_media(content_type: &str) -> bool {
    is_image(content_type) || is_video(content_type) || is_audio(content_type) || is_hls(content_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_image_types() {
        assert!(is_image("image/jpeg"));
        assert!(is_image("image/svg+xml"));
        assert!(is_image("IMAGE/PNG"));
        assert!(!is_image("image/x-made-up"));
    }

    #[test]
    fn classifies_video_and_audio() {
        assert!(is_video("video/mp4"));
        assert!(is_video("video/quicktime; codecs=avc1"));
        assert!(is_audio("audio/mpeg"));
        assert!(!is_video("audio/mpeg"));
    }

    #[test]
    fn classifies_hls() {
        assert!(is_hls("application/vnd.apple.mpegurl"));
        assert!(is_hls("application/x-mpegurl; charset=utf-8"));
        assert!(!is_hls("application/json"));
    }

    #[test]
    fn rejects_substring_bypass() {
        // A content type that merely contains "image" as a substring of a
        // larger, unrelated string must not pass.
        assert!(!is_image("text/html; image/png"));
        assert!(!is_media("text/htmlimage/pngsomething"));
    }

    #[test]
    fn is_media_covers_every_kind() {
        assert!(is_media("image/png"));
        assert!(is_media("video/webm"));
        assert!(is_media("audio/flac"));
        assert!(is_media("audio/x-mpegurl"));
        assert!(!is_media("application/json"));
        assert!(!is_media("text/plain"));
    }
}
