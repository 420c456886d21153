// Copyright 2026 bingo Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Snapshot encoding for values held by the shared cache.
//!
//! Layout of an encoded snapshot:
//!
//! ```text
//! | magic (1B) | compression (1B) | checksum (8B, xxhash64 of payload, BE) | payload |
//! ```

use std::io::Write;

use serde::{de::DeserializeOwned, Serialize};
use twox_hash::XxHash64;

use crate::error::{Error, ErrorKind, Result};

const MAGIC: u8 = 0xb1;
const HEADER_LEN: usize = 10;

/// Compression algorithm applied to snapshot payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Compression {
    /// No compression.
    None,
    /// Zstd compression.
    #[default]
    Zstd,
    /// Lz4 compression.
    Lz4,
}

impl Compression {
    /// Get the u8 that represent the compression algorithm.
    pub fn to_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
            Self::Lz4 => 2,
        }
    }
}

impl From<Compression> for u8 {
    fn from(value: Compression) -> Self {
        value.to_u8()
    }
}

impl TryFrom<u8> for Compression {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Zstd),
            2 => Ok(Self::Lz4),
            _ => Err(Error::new(ErrorKind::Codec, "unsupported compression algorithm").with_context("tag", value)),
        }
    }
}

/// Checksum used by snapshots.
pub fn checksum64(buf: &[u8]) -> u64 {
    XxHash64::oneshot(0, buf)
}

/// Encodes and decodes `serde` values as compressed, checksummed snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCodec {
    compression: Compression,
}

impl SnapshotCodec {
    /// Create a codec with the given compression algorithm.
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    /// Compression algorithm used when encoding.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Encode the value into a snapshot.
    pub fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        let mut buffer = vec![0; HEADER_LEN];

        match self.compression {
            Compression::None => {
                bincode::serialize_into(&mut buffer, value).map_err(Error::from)?;
            }
            Compression::Zstd => {
                let encoder = zstd::Encoder::new(&mut buffer, 0).map_err(Error::from)?.auto_finish();
                bincode::serialize_into(encoder, value).map_err(Error::from)?;
            }
            Compression::Lz4 => {
                let mut encoder = lz4::EncoderBuilder::new()
                    .checksum(lz4::ContentChecksum::NoChecksum)
                    .build(&mut buffer)
                    .map_err(Error::from)?;
                bincode::serialize_into(&mut encoder, value).map_err(Error::from)?;
                let (_, res) = encoder.finish();
                res.map_err(Error::from)?;
            }
        }

        let checksum = checksum64(&buffer[HEADER_LEN..]);
        let mut header = &mut buffer[..HEADER_LEN];
        header.write_all(&[MAGIC, self.compression.to_u8()])?;
        header.write_all(&checksum.to_be_bytes())?;

        Ok(buffer)
    }

    /// Decode a snapshot.
    ///
    /// The compression algorithm is read from the snapshot header, so snapshots written by codecs with different
    /// settings can always be decoded.
    pub fn decode<T>(&self, buf: &[u8]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        if buf.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::Codec, "snapshot is shorter than its header").with_context("len", buf.len()));
        }
        if buf[0] != MAGIC {
            return Err(Error::new(ErrorKind::MagicMismatch, "not a bingo snapshot").with_context("magic", buf[0]));
        }
        let compression = Compression::try_from(buf[1])?;

        let mut expected = [0; 8];
        expected.copy_from_slice(&buf[2..HEADER_LEN]);
        let expected = u64::from_be_bytes(expected);

        let payload = &buf[HEADER_LEN..];
        let get = checksum64(payload);
        if expected != get {
            return Err(Error::new(ErrorKind::ChecksumMismatch, "snapshot payload corrupted")
                .with_context("expected", expected)
                .with_context("get", get));
        }

        match compression {
            Compression::None => bincode::deserialize_from(payload).map_err(Error::from),
            Compression::Zstd => {
                let decoder = zstd::Decoder::new(payload).map_err(Error::from)?;
                bincode::deserialize_from(decoder).map_err(Error::from)
            }
            Compression::Lz4 => {
                let decoder = lz4::Decoder::new(payload).map_err(Error::from)?;
                bincode::deserialize_from(decoder).map_err(Error::from)
            }
        }
    }
}
