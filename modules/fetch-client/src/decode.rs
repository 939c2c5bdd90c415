//! Content-encoding handling.
//!
//! Decoding never fails: corrupt or unsupported payloads produce a
//! diagnostic placeholder so the pipeline keeps moving with visible,
//! degraded data instead of crashing the run.

use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Decode `body` according to the response's `content-encoding` value.
pub fn decode_body(body: &[u8], encoding: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    let encoding = encoding.trim().to_lowercase();
    match encoding.as_str() {
        "" | "identity" => lossy(body),
        "gzip" => decode_gzip(body),
        "deflate" => decode_deflate(body),
        "br" => decode_brotli(body),
        other => format!("<unsupported encoding {other}>"),
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn decode_gzip(body: &[u8]) -> String {
    let mut out = Vec::new();
    match GzDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => lossy(&out),
        Err(err) => format!("<gzip decode failed: {err}>"),
    }
}

/// Servers disagree on whether "deflate" means a raw deflate stream or a
/// zlib stream; try raw first, then zlib.
fn decode_deflate(body: &[u8]) -> String {
    let mut out = Vec::new();
    if DeflateDecoder::new(body).read_to_end(&mut out).is_ok() {
        return lossy(&out);
    }
    out.clear();
    match ZlibDecoder::new(body).read_to_end(&mut out) {
        Ok(_) => lossy(&out),
        Err(err) => format!("<deflate decode failed: {err}>"),
    }
}

#[cfg(feature = "brotli")]
fn decode_brotli(body: &[u8]) -> String {
    let mut out = Vec::new();
    match brotli::Decompressor::new(body, 4096).read_to_end(&mut out) {
        Ok(_) => lossy(&out),
        Err(err) => format!("<br decode failed: {err}>"),
    }
}

#[cfg(not(feature = "brotli"))]
fn decode_brotli(_body: &[u8]) -> String {
    "<brotli support not built; raw bytes omitted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    const SAMPLE: &str = "washed article body, 汉字 included";

    #[test]
    fn identity_and_empty() {
        assert_eq!(decode_body(b"", "gzip"), "");
        assert_eq!(decode_body(SAMPLE.as_bytes(), ""), SAMPLE);
        assert_eq!(decode_body(SAMPLE.as_bytes(), "identity"), SAMPLE);
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decode_body(&compressed, "gzip"), SAMPLE);
    }

    #[test]
    fn gzip_garbage_yields_placeholder() {
        let text = decode_body(b"definitely not gzip", "gzip");
        assert!(text.starts_with("<gzip decode failed:"), "got: {text}");
    }

    #[test]
    fn deflate_accepts_zlib_stream() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decode_body(&compressed, "deflate"), SAMPLE);
    }

    #[test]
    fn deflate_accepts_raw_stream() {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decode_body(&compressed, "deflate"), SAMPLE);
    }

    #[cfg(feature = "brotli")]
    #[test]
    fn brotli_round_trip() {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(SAMPLE.as_bytes()).unwrap();
        }
        assert_eq!(decode_body(&out, "br"), SAMPLE);
    }

    #[test]
    fn unsupported_encoding_names_the_codec() {
        assert_eq!(
            decode_body(SAMPLE.as_bytes(), "zstd"),
            "<unsupported encoding zstd>"
        );
    }
}
