use crate::error::{Error, Result};

pub mod frame;
pub mod zion;
pub mod zstd;

/// Compressor state for one output stream. Instances are cheap to create;
/// the expensive encoder contexts are pooled per thread and returned when
/// the compressor is dropped.
pub trait Compressor: Send {
    fn name(&self) -> &'static str;
    /// Compress `src`, appending to `dst`.
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;
}

/// Decompressor state for one input stream. `decompress` must fill `dst`
/// completely. Instances are per-caller, so concurrent decodes from many
/// threads each own their state; context pooling is per thread.
pub trait Decompressor: Send {
    fn name(&self) -> &'static str;
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// True when `algo` names the columnar codec family; columnar streams are
/// self-identifying so sub-variants share one decoder.
pub fn is_zion(algo: &str) -> bool {
    algo.starts_with("zion")
}

pub fn compressor_by_name(algo: &str) -> Option<Box<dyn Compressor>> {
    match algo {
        "zstd" => Some(Box::new(zstd::ZstdCompressor::new("zstd", zstd::LEVEL_DEFAULT, true))),
        "zstd-better" => Some(Box::new(zstd::ZstdCompressor::new(
            "zstd-better",
            zstd::LEVEL_BETTER,
            true,
        ))),
        "zstd-nocrc" => Some(Box::new(zstd::ZstdCompressor::new(
            "zstd-nocrc",
            zstd::LEVEL_DEFAULT,
            false,
        ))),
        "zion" | "zion+zstd" => Some(Box::new(zion::ZionCompressor::new(zion::BucketAlgo::Zstd))),
        "zion+iguana_v0" => Some(Box::new(zion::ZionCompressor::new(zion::BucketAlgo::IguanaV0))),
        "zion+iguana_v0/specialized" => Some(Box::new(zion::ZionCompressor::new(
            zion::BucketAlgo::IguanaV0Specialized,
        ))),
        _ => None,
    }
}

pub fn decompressor_by_name(algo: &str) -> Option<Box<dyn Decompressor>> {
    if is_zion(algo) {
        // sub-variant is recorded in the container header
        return match algo {
            "zion" | "zion+zstd" | "zion+iguana_v0" | "zion+iguana_v0/specialized" => {
                Some(Box::new(zion::ZionDecoder::new()))
            }
            _ => None,
        };
    }
    match algo {
        "zstd" | "zstd-better" | "zstd-nocrc" => Some(Box::new(zstd::ZstdDecompressor::new(algo))),
        _ => None,
    }
}

/// `compressor_by_name` that turns an unknown name into an error.
pub fn must_compress(algo: &str) -> Result<Box<dyn Compressor>> {
    compressor_by_name(algo).ok_or_else(|| Error::UnsupportedCodec(algo.to_string()))
}

pub fn must_decompress(algo: &str) -> Result<Box<dyn Decompressor>> {
    decompressor_by_name(algo).ok_or_else(|| Error::UnsupportedCodec(algo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names() {
        for name in [
            "zstd",
            "zstd-better",
            "zstd-nocrc",
            "zion",
            "zion+zstd",
            "zion+iguana_v0",
            "zion+iguana_v0/specialized",
        ] {
            assert!(compressor_by_name(name).is_some(), "{name}");
            assert!(decompressor_by_name(name).is_some(), "{name}");
        }
        assert!(compressor_by_name("lz77").is_none());
        assert!(matches!(
            must_compress("nope"),
            Err(Error::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn zion_is_self_identifying() {
        assert!(is_zion("zion"));
        assert!(is_zion("zion+iguana_v0/specialized"));
        assert!(!is_zion("zstd"));
    }
}
