//! Packs entries into gzip-compressed chunks of newline-delimited JSON.
//!
//! One [`Packer`] accumulates the open chunk of one group. Once appending an
//! entry would push the uncompressed buffer past the limit, the buffer is
//! sealed as the current sequence number and the sequence moves on. Entries
//! carry a back-pointer to the previous chunk their subscription wrote to,
//! which gives every subscription a linked list through the chunks.

use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("compression error: {0}")]
    Io(#[from] io::Error),

    #[error("entry encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One stored article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(rename = "subId")]
    pub sub_id: u64,
    pub title: String,
    pub content: String,
    pub link: String,
    /// UTC seconds.
    pub published: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<u64>,
}

/// Uncompressed buffer limit for a target compressed chunk size.
///
/// JSON article text compresses by roughly 3.5x, so the buffer may grow to
/// 3.5 times the target before it is sealed.
pub fn chunk_limit(package_size_kb: usize) -> usize {
    package_size_kb * 1024 * 7 / 2
}

/// A chunk that left the packer and must be written under its numeric key.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub id: u64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Packer {
    buffer: Vec<u8>,
    limit: usize,
    sequence: u64,
    appended: usize,
}

impl Packer {
    pub fn new(sequence: u64, limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            sequence,
            appended: 0,
        }
    }

    /// Resume the open chunk from the compressed contents of its latest slot.
    pub fn hydrate(sequence: u64, limit: usize, compressed: &[u8]) -> Result<Self, PackError> {
        let mut packer = Self::new(sequence, limit);
        packer.buffer = decompress(compressed)?;
        debug!(
            "Hydrated chunk {} with {} bytes",
            sequence,
            packer.buffer.len()
        );
        Ok(packer)
    }

    /// Id of the open chunk.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether anything was appended since the packer was created.
    pub fn is_dirty(&self) -> bool {
        self.appended > 0
    }

    /// Append an entry, sealing the open chunk first if it would overflow.
    ///
    /// `last_chunk` is the subscription's pointer to the chunk its newest
    /// entry lives in; it is updated here.
    pub fn append(
        &mut self,
        mut entry: Entry,
        last_chunk: &mut Option<u64>,
    ) -> Result<Option<SealedChunk>, PackError> {
        // Measured with the widest back-pointer the entry can end up with.
        entry.prev = *last_chunk;
        let size = serde_json::to_vec(&entry)?.len() + 1;
        entry.prev = None;

        let sealed = if !self.buffer.is_empty() && self.buffer.len() + size > self.limit {
            let id = self.sequence;
            let data = self.seal()?;
            self.sequence += 1;
            debug!("Sealed chunk {} ({} bytes compressed)", id, data.len());
            Some(SealedChunk { id, data })
        } else {
            None
        };

        if *last_chunk != Some(self.sequence) {
            entry.prev = *last_chunk;
            *last_chunk = Some(self.sequence);
        }

        serde_json::to_writer(&mut self.buffer, &entry)?;
        self.buffer.push(b'\n');
        self.appended += 1;

        Ok(sealed)
    }

    /// Compress the buffer and reset it.
    pub fn seal(&mut self) -> Result<Vec<u8>, PackError> {
        let data = compress(&self.buffer)?;
        self.buffer.clear();
        Ok(data)
    }
}

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Decode a whole chunk into its entries, in append order.
pub fn decode_chunk(compressed: &[u8]) -> Result<Vec<Entry>, PackError> {
    let raw = decompress(compressed)?;
    serde_json::Deserializer::from_slice(&raw)
        .into_iter::<Entry>()
        .map(|entry| entry.map_err(PackError::from))
        .collect()
}
