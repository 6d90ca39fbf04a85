//! Magic-byte content type detection over the first [`SNIFF_LEN`] bytes of a blob.
//!
//! Follows the WHATWG MIME sniffing order: markup, documents, byte-order
//! marks, images, media, fonts, archives, then the text/binary split.

/// Number of leading bytes inspected.
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

const EXACT: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", TEXT_PLAIN),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"\x00\x00\x02\x00", "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"ID3", "audio/mpeg"),
    (b"OggS\x00", "application/ogg"),
    (b"MThd\x00\x00\x00\x06", "audio/midi"),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x00\x01\x00\x00", "font/ttf"),
    (b"OTTO", "font/otf"),
    (b"ttcf", "font/collection"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    (b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    (b"\x00asm", "application/wasm"),
];

/// RIFF/FORM containers: outer tag at 0, form type at 8.
const CONTAINERS: &[(&[u8], &[u8], &str)] = &[
    (b"RIFF", b"WEBPVP", "image/webp"),
    (b"RIFF", b"WAVE", "audio/wave"),
    (b"RIFF", b"AVI ", "video/avi"),
    (b"FORM", b"AIFF", "audio/aiff"),
];

/// Best-effort content type of `data`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    let trimmed = skip_whitespace(data);
    if HTML_TAGS.iter().any(|tag| is_html_tag(trimmed, tag)) {
        return "text/html; charset=utf-8";
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    if let Some((_, mime)) = EXACT.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *mime;
    }
    for (outer, form, mime) in CONTAINERS {
        if data.starts_with(outer) && data.len() >= 8 + form.len() && data[8..].starts_with(form)
        {
            return *mime;
        }
    }
    if is_mp4(data) {
        return "video/mp4";
    }

    if data.iter().any(|&b| is_binary_byte(b)) {
        OCTET_STREAM
    } else {
        TEXT_PLAIN
    }
}

fn skip_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn is_html_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() < tag.len() + 1 {
        return false;
    }
    let matches = data
        .iter()
        .zip(tag.iter())
        .all(|(b, t)| b.to_ascii_uppercase() == *t);
    matches && matches!(data[tag.len()], b' ' | b'>')
}

fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size % 4 != 0 || data.len() < box_size || &data[4..8] != b"ftyp" {
        return false;
    }
    (8..box_size).step_by(4).any(|start| {
        start != 12 && data.len() >= start + 3 && &data[start..start + 3] == b"mp4"
    })
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_formats() {
        let cases: &[(&[u8], &str)] = &[
            (b"\x89PNG\x0D\x0A\x1A\x0A\x00\x00\x00\x0DIHDR", "image/png"),
            (b"\xFF\xD8\xFF\xE0\x00\x10JFIF", "image/jpeg"),
            (b"GIF89a\x01\x00", "image/gif"),
            (b"RIFF\x24\x00\x00\x00WEBPVP8 ", "image/webp"),
            (b"RIFF\x24\x00\x00\x00WAVEfmt ", "audio/wave"),
            (b"%PDF-1.7\n", "application/pdf"),
            (b"PK\x03\x04\x14\x00", "application/zip"),
            (b"\x1F\x8B\x08\x00", "application/x-gzip"),
            (b"\x00asm\x01\x00\x00\x00", "application/wasm"),
            (b"  <!doctype html><html>", "text/html; charset=utf-8"),
            (b"<p>hello</p>", "text/html; charset=utf-8"),
            (b"<?xml version=\"1.0\"?>", "text/xml; charset=utf-8"),
            (b"plain old text\n", TEXT_PLAIN),
            (b"", TEXT_PLAIN),
            (b"\x00\x01\x02\x03garbage", OCTET_STREAM),
        ];
        for (data, expected) in cases {
            assert_eq!(detect_content_type(data), *expected, "input {data:?}");
        }
    }

    #[test]
    fn detects_mp4_ftyp_box() {
        let mut data = vec![0x00, 0x00, 0x00, 0x1C];
        data.extend_from_slice(b"ftypisom\x00\x00\x02\x00isomiso2mp41");
        assert_eq!(detect_content_type(&data), "video/mp4");
    }

    #[test]
    fn html_tag_needs_terminator() {
        assert_eq!(detect_content_type(b"<a href=\"/\">x</a>"), "text/html; charset=utf-8");
        assert_eq!(detect_content_type(b"<Applesauce"), TEXT_PLAIN);
    }

    #[test]
    fn only_first_block_is_inspected() {
        let mut data = vec![b'a'; SNIFF_LEN];
        data.push(0x00);
        assert_eq!(detect_content_type(&data), TEXT_PLAIN);
    }
}
