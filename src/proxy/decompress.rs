//! Response body decompression.
//!
//! Buffered origin responses are decoded before hooks see them so rules can
//! inspect plain bytes. Supported encodings: `gzip` (`x-gzip`), `deflate`
//! (zlib-wrapped, with a raw deflate fallback) and `br`. Anything else passes
//! through untouched.

use super::error::{ProxyError, ProxyResult};
use super::hooks::ResponseDetail;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use hyper::header::{CONTENT_ENCODING, HeaderValue};
use std::io::{Cursor, Read};

/// Records the `content-encoding` the origin sent.
pub const ORIGIN_CONTENT_ENCODING: &str = "x-eden-proxy-origin-content-encoding";

/// Records the body length the origin sent, before decoding.
pub const ORIGIN_CONTENT_LENGTH: &str = "x-eden-proxy-origin-content-length";

/// Decode `data` for `encoding`. Returns `None` for unsupported encodings.
pub fn decompress(encoding: &str, data: &[u8]) -> ProxyResult<Option<Bytes>> {
    let encoding = encoding.trim().to_ascii_lowercase();
    let decoded = match encoding.as_str() {
        "gzip" | "x-gzip" => read_all(GzDecoder::new(data), &encoding)?,
        "deflate" => match read_all(ZlibDecoder::new(data), &encoding) {
            Ok(decoded) => decoded,
            Err(_) => read_all(DeflateDecoder::new(data), &encoding)?,
        },
        "br" => {
            let mut decoded = Vec::new();
            brotli::BrotliDecompress(&mut Cursor::new(data), &mut decoded).map_err(|e| {
                ProxyError::Decode {
                    encoding: encoding.clone(),
                    message: e.to_string(),
                }
            })?;
            decoded
        }
        _ => return Ok(None),
    };
    Ok(Some(Bytes::from(decoded)))
}

/// Decode a buffered response in place and rewrite its headers.
///
/// Only a successful decode touches the headers: `content-encoding` moves to
/// [`ORIGIN_CONTENT_ENCODING`] and the encoded length is kept in
/// [`ORIGIN_CONTENT_LENGTH`].
pub fn decompress_response(response: &mut ResponseDetail) -> ProxyResult<()> {
    let Some(headers) = response.headers.as_mut() else {
        return Ok(());
    };

    let Some(encoding) = headers.get(CONTENT_ENCODING).cloned() else {
        return Ok(());
    };
    if response.body.is_empty() {
        return Ok(());
    }
    let Ok(name) = encoding.to_str() else {
        return Ok(());
    };

    if let Some(decoded) = decompress(name, &response.body)? {
        headers.remove(CONTENT_ENCODING);
        headers.insert(ORIGIN_CONTENT_ENCODING, encoding);
        headers.insert(ORIGIN_CONTENT_LENGTH, HeaderValue::from(response.body.len()));
        response.body = decoded;
    }
    Ok(())
}

fn read_all<R: Read>(mut reader: R, encoding: &str) -> ProxyResult<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| ProxyError::Decode {
            encoding: encoding.to_string(),
            message: e.to_string(),
        })?;
    Ok(out)
}
