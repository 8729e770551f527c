//! Image unpacking
//!
//! Kernel images and device trees may arrive gzip- or zstd-compressed; the
//! format is picked from the leading magic bytes, anything else is raw.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::LoadError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Gzip,
    Zstd,
}

pub fn detect(data: &[u8]) -> ImageFormat {
    if data.starts_with(&GZIP_MAGIC) {
        ImageFormat::Gzip
    } else if data.starts_with(&ZSTD_MAGIC) {
        ImageFormat::Zstd
    } else {
        ImageFormat::Raw
    }
}

pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, LoadError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(LoadError::Decompress)?;
    Ok(out)
}

pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, LoadError> {
    zstd::stream::decode_all(data).map_err(LoadError::Decompress)
}

/// Raw bytes of `data`, decompressing if it carries a known magic.
pub fn unpack_image(data: &[u8]) -> Result<Cow<'_, [u8]>, LoadError> {
    match detect(data) {
        ImageFormat::Raw => Ok(Cow::Borrowed(data)),
        ImageFormat::Gzip => {
            let out = decompress_gzip(data)?;
            log::debug!("gunzipped image: {} -> {} bytes", data.len(), out.len());
            Ok(Cow::Owned(out))
        }
        ImageFormat::Zstd => {
            let out = decompress_zstd(data)?;
            log::debug!("zstd image: {} -> {} bytes", data.len(), out.len());
            Ok(Cow::Owned(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const PAYLOAD: &[u8] = b"\x6f\x00\x00\x00 kernel bytes kernel bytes kernel bytes";

    #[test]
    fn test_raw_is_borrowed() {
        let out = unpack_image(PAYLOAD).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, PAYLOAD);
    }

    #[test]
    fn test_gzip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(PAYLOAD).unwrap();
        let packed = enc.finish().unwrap();

        assert_eq!(detect(&packed), ImageFormat::Gzip);
        assert_eq!(&*unpack_image(&packed).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_zstd() {
        let packed = zstd::stream::encode_all(PAYLOAD, 0).unwrap();
        assert_eq!(detect(&packed), ImageFormat::Zstd);
        assert_eq!(&*unpack_image(&packed).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_truncated_gzip_fails() {
        let data = [0x1f, 0x8b, 0x08, 0x00];
        assert!(matches!(unpack_image(&data), Err(LoadError::Decompress(_))));
    }
}
