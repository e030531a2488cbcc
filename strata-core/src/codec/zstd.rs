use std::cell::RefCell;

use zstd::bulk;
use zstd::zstd_safe;

use super::{Compressor, Decompressor};
use crate::error::{Error, Result};

pub const LEVEL_DEFAULT: i32 = 3;
pub const LEVEL_BETTER: i32 = 9;

thread_local! {
    static CCTX_POOL: RefCell<Vec<bulk::Compressor<'static>>> = const { RefCell::new(Vec::new()) };
    static DCTX_POOL: RefCell<Vec<bulk::Decompressor<'static>>> = const { RefCell::new(Vec::new()) };
}

fn checkout_cctx() -> Result<bulk::Compressor<'static>> {
    if let Some(c) = CCTX_POOL.with(|p| p.borrow_mut().pop()) {
        return Ok(c);
    }
    Ok(bulk::Compressor::new(LEVEL_DEFAULT)?)
}

fn checkin_cctx(c: bulk::Compressor<'static>) {
    CCTX_POOL.with(|p| p.borrow_mut().push(c));
}

fn checkout_dctx() -> Result<bulk::Decompressor<'static>> {
    if let Some(d) = DCTX_POOL.with(|p| p.borrow_mut().pop()) {
        return Ok(d);
    }
    Ok(bulk::Decompressor::new()?)
}

fn checkin_dctx(d: bulk::Decompressor<'static>) {
    DCTX_POOL.with(|p| p.borrow_mut().push(d));
}

pub struct ZstdCompressor {
    name: &'static str,
    level: i32,
    checksum: bool,
    ctx: Option<bulk::Compressor<'static>>,
}

impl ZstdCompressor {
    pub fn new(name: &'static str, level: i32, checksum: bool) -> Self {
        ZstdCompressor {
            name,
            level,
            checksum,
            ctx: None,
        }
    }

    fn ctx(&mut self) -> Result<&mut bulk::Compressor<'static>> {
        if self.ctx.is_none() {
            let mut c = checkout_cctx()?;
            c.set_parameter(zstd_safe::CParameter::CompressionLevel(self.level))?;
            c.set_parameter(zstd_safe::CParameter::ChecksumFlag(self.checksum))?;
            self.ctx = Some(c);
        }
        Ok(self.ctx.as_mut().unwrap())
    }
}

impl Compressor for ZstdCompressor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let out = self.ctx()?.compress(src)?;
        dst.extend_from_slice(&out);
        Ok(())
    }
}

impl Drop for ZstdCompressor {
    fn drop(&mut self) {
        if let Some(c) = self.ctx.take() {
            checkin_cctx(c);
        }
    }
}

pub struct ZstdDecompressor {
    name: &'static str,
    ctx: Option<bulk::Decompressor<'static>>,
}

impl ZstdDecompressor {
    pub fn new(algo: &str) -> Self {
        let name = match algo {
            "zstd-better" => "zstd-better",
            "zstd-nocrc" => "zstd-nocrc",
            _ => "zstd",
        };
        ZstdDecompressor { name, ctx: None }
    }
}

impl Decompressor for ZstdDecompressor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        if self.ctx.is_none() {
            self.ctx = Some(checkout_dctx()?);
        }
        let n = self
            .ctx
            .as_mut()
            .unwrap()
            .decompress_to_buffer(src, dst)
            .map_err(|e| Error::corrupt(format!("zstd: {e}")))?;
        if n != dst.len() {
            return Err(Error::frame(format!(
                "decompressed {n} bytes, expected {}",
                dst.len()
            )));
        }
        Ok(())
    }
}

impl Drop for ZstdDecompressor {
    fn drop(&mut self) {
        if let Some(d) = self.ctx.take() {
            checkin_dctx(d);
        }
    }
}

/// One-shot helpers for metadata payloads (tree nodes, descriptor lists),
/// which are compressed whole rather than framed.
pub fn compress_block(src: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::stream::encode_all(src, LEVEL_DEFAULT)?)
}

pub fn decompress_block(src: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(src).map_err(|e| Error::corrupt(format!("zstd: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_exact_fill() {
        let src: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut comp = ZstdCompressor::new("zstd", LEVEL_DEFAULT, true);
        let mut packed = Vec::new();
        comp.compress(&src, &mut packed).unwrap();
        assert!(packed.len() < src.len());

        let mut dec = ZstdDecompressor::new("zstd");
        let mut out = vec![0u8; src.len()];
        dec.decompress(&packed, &mut out).unwrap();
        assert_eq!(out, src);

        // wrong output size is a frame error
        let mut short = vec![0u8; src.len() - 1];
        assert!(dec.decompress(&packed, &mut short).is_err());
    }

    #[test]
    fn block_helpers_roundtrip() {
        let src = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let packed = compress_block(&src).unwrap();
        assert_eq!(decompress_block(&packed).unwrap(), src);
    }
}
