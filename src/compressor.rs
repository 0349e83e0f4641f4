//! Types of supported compression algorithms

#[cfg(any(feature = "gzip", feature = "xz"))]
use std::io::Read;

use deku::prelude::*;
#[cfg(feature = "gzip")]
use flate2::read::{ZlibDecoder, ZlibEncoder};
#[cfg(feature = "gzip")]
use flate2::Compression;
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::read::{XzDecoder, XzEncoder};
#[cfg(feature = "xz")]
use xz2::stream::{Check, Filters, LzmaOptions, Stream};

use crate::error::PackError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    #[default]
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

impl Compressor {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gzip" => Some(Compressor::Gzip),
            "lzo" => Some(Compressor::Lzo),
            "xz" => Some(Compressor::Xz),
            "lz4" => Some(Compressor::Lz4),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Gzip => "gzip",
            Compressor::Lzma => "lzma",
            Compressor::Lzo => "lzo",
            Compressor::Xz => "xz",
            Compressor::Lz4 => "lz4",
            Compressor::Zstd => "zstd",
        }
    }
}

/// Compressor options as stored in the image, chosen by `--comp-extra`
#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(ctx = "compressor: Compressor")]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(Gzip),

    #[deku(id = "Compressor::Lzo")]
    Lzo(Lzo),

    #[deku(id = "Compressor::Xz")]
    Xz(Xz),

    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4),

    #[deku(id = "Compressor::Zstd")]
    Zstd(Zstd),

    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Xz {
    pub dictionary_size: u32,
    /// Bit wise OR of the branch/call/jump filter bits
    pub filters: u32,
}

pub const XZ_FILTER_X86: u32 = 0x01;
pub const XZ_FILTER_POWERPC: u32 = 0x02;
pub const XZ_FILTER_IA64: u32 = 0x04;
pub const XZ_FILTER_ARM: u32 = 0x08;
pub const XZ_FILTER_ARMTHUMB: u32 = 0x10;
pub const XZ_FILTER_SPARC: u32 = 0x20;

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Zstd {
    pub compression_level: u32,
}

/// Compressor id plus the options it was configured with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FilesystemCompressor {
    pub id: Compressor,
    pub options: Option<CompressionOptions>,
}

impl FilesystemCompressor {
    pub fn new(id: Compressor, options: Option<CompressionOptions>) -> Result<Self, PackError> {
        let supported = match id {
            Compressor::None => true,
            Compressor::Gzip => cfg!(feature = "gzip"),
            Compressor::Xz => cfg!(feature = "xz"),
            Compressor::Lzo => cfg!(feature = "lzo"),
            Compressor::Zstd => cfg!(feature = "zstd"),
            Compressor::Lz4 => cfg!(feature = "lz4"),
            Compressor::Lzma => false,
        };
        if !supported {
            return Err(PackError::CompressorInit(format!(
                "{} support is not compiled in",
                id.name()
            )));
        }
        if let Some(options) = &options {
            let matches = matches!(
                (id, options),
                (Compressor::Gzip, CompressionOptions::Gzip(_))
                    | (Compressor::Lzo, CompressionOptions::Lzo(_))
                    | (Compressor::Xz, CompressionOptions::Xz(_))
                    | (Compressor::Lz4, CompressionOptions::Lz4(_))
                    | (Compressor::Zstd, CompressionOptions::Zstd(_))
            );
            if !matches {
                return Err(PackError::CompressorInit(
                    "options do not match the selected compressor".to_string(),
                ));
            }
        }
        Ok(Self { id, options })
    }

    /// Parse a `--comp-extra` CSV like `level=9,window=14` into options
    pub fn parse_extra(id: Compressor, csv: &str) -> Result<CompressionOptions, PackError> {
        let mut gzip = Gzip { compression_level: 9, window_size: 15, strategies: 0 };
        let mut xz = Xz { dictionary_size: 0, filters: 0 };
        let mut lz4 = Lz4 { version: 1, flags: 0 };
        let mut zstd = Zstd { compression_level: 15 };
        let mut lzo = Lzo { algorithm: 4, compression_level: 8 };

        let err = |msg: String| PackError::CompressorInit(msg);

        for part in csv.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (part, None),
            };
            let num = |v: Option<&str>| -> Result<u32, PackError> {
                let v = v.ok_or_else(|| err(format!("option `{key}` needs a value")))?;
                let multiplier = if v.ends_with('K') {
                    1024
                } else if v.ends_with('M') {
                    1024 * 1024
                } else {
                    1
                };
                v.trim_end_matches(['K', 'M'])
                    .parse::<u32>()
                    .map(|out| out * multiplier)
                    .map_err(|e| err(format!("option `{key}`: {e}")))
            };
            match (id, key) {
                (Compressor::Gzip, "level") => {
                    gzip.compression_level = num(value)?;
                    if !(1..=9).contains(&gzip.compression_level) {
                        return Err(err("gzip level must be in [1, 9]".to_string()));
                    }
                }
                (Compressor::Gzip, "window") => {
                    gzip.window_size = num(value)? as u16;
                    if !(8..=15).contains(&gzip.window_size) {
                        return Err(err("gzip window must be in [8, 15]".to_string()));
                    }
                }
                (Compressor::Xz, "dictsize") => xz.dictionary_size = num(value)?,
                (Compressor::Xz, "x86") => xz.filters |= XZ_FILTER_X86,
                (Compressor::Xz, "powerpc") => xz.filters |= XZ_FILTER_POWERPC,
                (Compressor::Xz, "ia64") => xz.filters |= XZ_FILTER_IA64,
                (Compressor::Xz, "arm") => xz.filters |= XZ_FILTER_ARM,
                (Compressor::Xz, "armthumb") => xz.filters |= XZ_FILTER_ARMTHUMB,
                (Compressor::Xz, "sparc") => xz.filters |= XZ_FILTER_SPARC,
                (Compressor::Zstd, "level") => {
                    zstd.compression_level = num(value)?;
                    if !(1..=22).contains(&zstd.compression_level) {
                        return Err(err("zstd level must be in [1, 22]".to_string()));
                    }
                }
                (Compressor::Lzo, "level") => lzo.compression_level = num(value)?,
                _ => {
                    return Err(err(format!(
                        "compressor {} has no option `{key}`",
                        id.name()
                    )))
                }
            }
        }

        Ok(match id {
            Compressor::Gzip => CompressionOptions::Gzip(gzip),
            Compressor::Xz => CompressionOptions::Xz(xz),
            Compressor::Lz4 => CompressionOptions::Lz4(lz4),
            Compressor::Zstd => CompressionOptions::Zstd(zstd),
            Compressor::Lzo => CompressionOptions::Lzo(lzo),
            _ => {
                return Err(err(format!("compressor {} takes no options", id.name())));
            }
        })
    }

    /// Text printed by `-X help`
    pub fn extra_help(id: Compressor) -> &'static str {
        match id {
            Compressor::Gzip => {
                "gzip options:\n  level=<1..9>    compression level (default 9)\n  window=<8..15>  deflate window size (default 15)"
            }
            Compressor::Xz => {
                "xz options:\n  dictsize=<n[K|M]>  LZMA dictionary size (default: block size)\n  x86, arm, armthumb, powerpc, sparc, ia64\n                     enable a branch/call/jump filter"
            }
            Compressor::Zstd => "zstd options:\n  level=<1..22>  compression level (default 15)",
            Compressor::Lzo => "lzo options:\n  level=<1..9>  compression level (default 8)",
            Compressor::Lz4 => "lz4 options: none",
            Compressor::None | Compressor::Lzma => "no options",
        }
    }
}

impl Default for FilesystemCompressor {
    fn default() -> Self {
        Self { id: Compressor::default(), options: None }
    }
}

/// Using the compressor from the superblock, decompress bytes
#[instrument(skip_all)]
pub fn decompress(
    bytes: &[u8],
    out: &mut Vec<u8>,
    compressor: Compressor,
    max_size: usize,
) -> Result<(), PackError> {
    match compressor {
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            let mut decoder = ZlibDecoder::new(bytes);
            decoder
                .read_to_end(out)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
        }
        #[cfg(feature = "xz")]
        Compressor::Xz => {
            let mut decoder = XzDecoder::new(bytes);
            decoder
                .read_to_end(out)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
        }
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            out.resize(max_size, 0);
            let (written, error) = rust_lzo::LZOContext::decompress_to_slice(bytes, out);
            let out_size = written.len();
            out.truncate(out_size);
            if error != rust_lzo::LZOError::OK {
                return Err(PackError::CompressorRuntime("lzo decompress failed".to_string()));
            }
        }
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            let mut decoder = zstd::bulk::Decompressor::new()
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            out.reserve(max_size);
            decoder
                .decompress_to_buffer(bytes, out)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
        }
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => {
            out.resize(max_size, 0);
            let written = lz4_flex::block::decompress_into(bytes, out)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            out.truncate(written);
        }
        _ => {
            return Err(PackError::CompressorRuntime(format!(
                "no decompressor available for {}",
                compressor.name()
            )))
        }
    }
    Ok(())
}

/// Compress `bytes` with the configured compressor, returning the compressed copy
#[instrument(skip_all)]
pub fn compress(
    bytes: &[u8],
    fc: FilesystemCompressor,
    block_size: u32,
) -> Result<Vec<u8>, PackError> {
    match (fc.id, fc.options) {
        (Compressor::None, _) => Ok(bytes.to_vec()),
        #[cfg(feature = "xz")]
        (Compressor::Xz, option @ (Some(CompressionOptions::Xz(_)) | None)) => {
            let dict_size = match option {
                Some(CompressionOptions::Xz(xz)) if xz.dictionary_size != 0 => xz.dictionary_size,
                _ => block_size,
            };
            let mut opts = LzmaOptions::new_preset(6)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            opts.dict_size(dict_size);

            let mut filters = Filters::new();
            if let Some(CompressionOptions::Xz(xz)) = option {
                if xz.filters & XZ_FILTER_X86 != 0 {
                    filters.x86();
                }
                if xz.filters & XZ_FILTER_POWERPC != 0 {
                    filters.powerpc();
                }
                if xz.filters & XZ_FILTER_IA64 != 0 {
                    filters.ia64();
                }
                if xz.filters & XZ_FILTER_ARM != 0 {
                    filters.arm();
                }
                if xz.filters & XZ_FILTER_ARMTHUMB != 0 {
                    filters.arm_thumb();
                }
                if xz.filters & XZ_FILTER_SPARC != 0 {
                    filters.sparc();
                }
            }
            filters.lzma2(&opts);

            let stream = Stream::new_stream_encoder(&filters, Check::Crc32)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            let mut encoder = XzEncoder::new_stream(bytes, stream);
            let mut buf = vec![];
            encoder
                .read_to_end(&mut buf)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            Ok(buf)
        }
        #[cfg(feature = "gzip")]
        (Compressor::Gzip, option @ (Some(CompressionOptions::Gzip(_)) | None)) => {
            let compression_level = match option {
                Some(CompressionOptions::Gzip(gzip)) => Compression::new(gzip.compression_level),
                _ => Compression::best(),
            };

            let mut encoder = ZlibEncoder::new(bytes, compression_level);
            let mut buf = vec![];
            encoder
                .read_to_end(&mut buf)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            Ok(buf)
        }
        #[cfg(feature = "lzo")]
        (Compressor::Lzo, _) => {
            let mut lzo = rust_lzo::LZOContext::new();
            let mut buf = vec![0; rust_lzo::worst_compress(bytes.len())];
            let error = lzo.compress(bytes, &mut buf);
            if error != rust_lzo::LZOError::OK {
                return Err(PackError::CompressorRuntime("lzo compress failed".to_string()));
            }
            Ok(buf)
        }
        #[cfg(feature = "lz4")]
        (Compressor::Lz4, _) => Ok(lz4_flex::block::compress(bytes)),
        #[cfg(feature = "zstd")]
        (Compressor::Zstd, option @ (Some(CompressionOptions::Zstd(_)) | None)) => {
            let compression_level = match option {
                Some(CompressionOptions::Zstd(zstd)) => zstd.compression_level,
                _ => 15,
            };
            let mut encoder = zstd::bulk::Compressor::new(compression_level as i32)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            let mut buf = Vec::with_capacity(bytes.len());
            encoder
                .compress_to_buffer(bytes, &mut buf)
                .map_err(|e| PackError::CompressorRuntime(e.to_string()))?;
            Ok(buf)
        }
        _ => Err(PackError::CompressorRuntime(format!(
            "no compressor available for {}",
            fc.id.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "gzip")]
    fn test_round_trip() {
        let fc = FilesystemCompressor::new(Compressor::Gzip, None).unwrap();
        let bytes = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbbbb".repeat(32);
        let cb = compress(&bytes, fc, 0x20000).unwrap();
        assert!(cb.len() < bytes.len());

        let mut out = vec![];
        decompress(&cb, &mut out, Compressor::Gzip, bytes.len()).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_extra_parse() {
        let opts = FilesystemCompressor::parse_extra(Compressor::Gzip, "level=3,window=14").unwrap();
        assert_eq!(
            opts,
            CompressionOptions::Gzip(Gzip { compression_level: 3, window_size: 14, strategies: 0 })
        );

        let opts = FilesystemCompressor::parse_extra(Compressor::Xz, "dictsize=64K,x86").unwrap();
        assert_eq!(
            opts,
            CompressionOptions::Xz(Xz { dictionary_size: 0x10000, filters: XZ_FILTER_X86 })
        );

        assert!(FilesystemCompressor::parse_extra(Compressor::Gzip, "nope=1").is_err());
    }
}
