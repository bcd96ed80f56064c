//! Random access over files stored as a sequence of independently compressed chunks.

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;
use tracing::{instrument, trace};

use crate::compression::{CompressionMethod, decompress, inflate_to_end};
use crate::endian::{ByteOrder, EndianReader, PREALLOC_LIMIT, read_exact_vec};
use crate::error::Error;

/// Largest uncompressed pak chunk size; anything larger (or negative) is Xbox 360 LZX data.
const MAX_PAK_CHUNK: i32 = 0x7F_FFFF;

/// Where a chunk's bytes live in the base stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocator {
    pub source_address: u64,
    /// `None` for chunks stored without compression.
    pub compressed_size: Option<u32>,
    pub uncompressed_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub source_address: u64,
    pub compressed_size: Option<u32>,
    pub dest_address: u64,
    pub uncompressed_size: u32,
}

impl Chunk {
    fn contains(&self, position: u64) -> bool {
        position >= self.dest_address && position < self.dest_address + self.uncompressed_size as u64
    }
}

/// Chunk table of an MCC compressed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McCompressedLayout {
    pub header_size: u32,
    pub chunk_count: u32,
    pub chunk_table_address: u64,
    /// Nominal uncompressed size of each chunk.
    pub chunk_size: u32,
}

enum ChunkData {
    Stored(Cursor<Arc<[u8]>>),
    Zlib(ZlibDecoder<Cursor<Arc<[u8]>>>),
}

impl Read for ChunkData {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ChunkData::Stored(c) => c.read(buf),
            ChunkData::Zlib(d) => d.read(buf),
        }
    }
}

struct LoadedChunk {
    index: usize,
    /// Bytes as stored in the base stream; already decompressed for Oodle chunks.
    data: Arc<[u8]>,
    reader: io::Take<ChunkData>,
}

/// Read-only stream presenting the concatenated uncompressed chunks.
///
/// Seeking is free: the containing chunk is located, loaded and decoded up to
/// the target offset on the next read.
pub struct ChunkStream<R> {
    base: R,
    codec: CompressionMethod,
    chunks: Vec<Chunk>,
    len: u64,
    position: u64,
    dirty: bool,
    current: Option<LoadedChunk>,
}

impl<R: Read + Seek> ChunkStream<R> {
    pub fn new(base: R, locators: impl IntoIterator<Item = ChunkLocator>, codec: CompressionMethod) -> Self {
        let mut dest_address = 0;
        let chunks: Vec<_> = locators
            .into_iter()
            .map(|l| {
                let chunk = Chunk {
                    source_address: l.source_address,
                    compressed_size: l.compressed_size,
                    dest_address,
                    uncompressed_size: l.uncompressed_size,
                };
                dest_address += l.uncompressed_size as u64;
                chunk
            })
            .collect();
        Self {
            base,
            codec,
            chunks,
            len: dest_address,
            position: 0,
            dirty: true,
            current: None,
        }
    }

    /// Saber3D `.pak`: an i32 chunk count and offset table, each chunk being an
    /// i32 uncompressed size followed by a zlib body.
    #[instrument(skip_all, name = "pak")]
    pub fn pak(mut base: R) -> Result<Self> {
        let end = base.seek(SeekFrom::End(0))?;
        let mut reader = EndianReader::new(&mut base, ByteOrder::LittleEndian);
        reader.seek(0)?;

        let count = reader.read::<i32>()?;
        let count = usize::try_from(count).map_err(|_| Error::InvalidValue {
            what: "pak chunk count",
            value: count as i64,
        })?;
        let mut offsets = reader
            .read_array::<i32>(count)?
            .into_iter()
            .map(|o| o as u64)
            .collect::<Vec<_>>();
        offsets.push(end);

        let mut locators = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for (&offset, &next) in offsets.iter().zip(&offsets[1..]) {
            reader.seek(offset)?;
            let size = reader.read::<i32>()?;
            if !(0..=MAX_PAK_CHUNK).contains(&size) {
                return Err(Error::UnsupportedFormat("Xbox 360 LZX compressed pak".into()).into());
            }
            let source_address = offset + 4;
            let compressed = next.checked_sub(source_address).ok_or(Error::InvalidValue {
                what: "pak chunk offset",
                value: next as i64,
            })?;
            locators.push(ChunkLocator {
                source_address,
                compressed_size: Some(compressed as u32),
                uncompressed_size: size as u32,
            });
        }
        Ok(Self::new(base, locators, CompressionMethod::Zlib))
    }

    /// MCC compressed cache: the uncompressed header followed by a table of
    /// zlib chunks; a negative size marks stored data after a two byte header.
    #[instrument(skip_all, name = "mcc_compressed")]
    pub fn mcc_compressed(mut base: R, layout: &McCompressedLayout) -> Result<Self> {
        let mut locators = vec![ChunkLocator {
            source_address: 0,
            compressed_size: None,
            uncompressed_size: layout.header_size,
        }];

        let mut reader = EndianReader::new(&mut base, ByteOrder::LittleEndian);
        for i in 0..layout.chunk_count as u64 {
            reader.seek(layout.chunk_table_address + i * 8)?;
            let size = reader.read::<i32>()?;
            let address = reader.read::<i32>()? as u64;

            let locator = if size < 0 {
                ChunkLocator {
                    source_address: address + 2,
                    compressed_size: None,
                    uncompressed_size: size.unsigned_abs(),
                }
            } else {
                // the actual size may be smaller than the nominal one
                reader.seek(address)?;
                let data = inflate_to_end(reader.get_mut().by_ref(), layout.chunk_size as usize)
                    .with_context(|| format!("inflating chunk {i} at {address:#x}"))?;
                ChunkLocator {
                    source_address: address,
                    compressed_size: Some(size as u32),
                    uncompressed_size: data.len() as u32,
                }
            };
            locators.push(locator);
        }
        Ok(Self::new(base, locators, CompressionMethod::Zlib))
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
    pub fn len(&self) -> u64 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn into_inner(self) -> R {
        self.base
    }

    fn prepare_chunk(&mut self) -> io::Result<()> {
        let index = self.chunks.partition_point(|c| c.dest_address + c.uncompressed_size as u64 <= self.position);
        let chunk = *self.chunks.get(index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no chunk contains {:#x}", self.position))
        })?;

        let data = match self.current.take() {
            Some(loaded) if loaded.index == index => loaded.data,
            _ => {
                trace!("loading chunk {index} from {:#x}", chunk.source_address);
                self.base.seek(SeekFrom::Start(chunk.source_address))?;
                let len = chunk.compressed_size.unwrap_or(chunk.uncompressed_size) as usize;
                let raw = read_exact_vec(&mut self.base, len)?;
                match (chunk.compressed_size, self.codec) {
                    (Some(_), CompressionMethod::Oodle) => {
                        decompress(CompressionMethod::Oodle, &raw, chunk.uncompressed_size as usize)
                            .map_err(io::Error::other)?
                            .into()
                    }
                    _ => raw.into(),
                }
            }
        };

        let cursor = Cursor::new(data.clone());
        let stored = chunk.compressed_size.is_none() || self.codec == CompressionMethod::Oodle;
        let mut reader = if stored {
            ChunkData::Stored(cursor)
        } else {
            ChunkData::Zlib(ZlibDecoder::new(cursor))
        }
        .take(chunk.uncompressed_size as u64);

        let skip = self.position - chunk.dest_address;
        if skip > 0 {
            let skipped = io::copy(&mut reader.by_ref().take(skip), &mut io::sink())?;
            if skipped != skip {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        self.current = Some(LoadedChunk { index, data, reader });
        Ok(())
    }
}

impl<R: Read + Seek> Read for ChunkStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.len {
            return Ok(0);
        }
        if self.dirty || self.current.is_none() {
            self.prepare_chunk()?;
            self.dirty = false;
        }

        let mut total = 0;
        while total < buf.len() && self.position < self.len {
            let Some(current) = self.current.as_mut() else {
                break;
            };
            let index = current.index;
            let n = current.reader.read(&mut buf[total..])?;
            total += n;
            self.position += n as u64;

            if !self.chunks[index].contains(self.position) {
                if self.position < self.len {
                    self.prepare_chunk()?;
                }
            } else if n == 0 {
                break;
            }
        }
        Ok(total)
    }
}

impl<R: Read + Seek> Seek for ChunkStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
            SeekFrom::End(offset) => self.len as i128 + offset as i128,
        };
        if target < 0 || target >= self.len as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {target:#x} outside stream of length {:#x}", self.len),
            ));
        }
        let target = target as u64;
        self.dirty |= target != self.position;
        self.position = target;
        Ok(target)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compression::compress;
    use pretty_assertions::assert_eq;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut out = vec![];
        compress(CompressionMethod::Zlib, data, &mut out).unwrap();
        out
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn pak(chunks: &[Vec<u8>]) -> Vec<u8> {
        let header_len = 4 + 4 * chunks.len();
        let mut body = vec![];
        let mut offsets = vec![];
        for chunk in chunks {
            offsets.push((header_len + body.len()) as i32);
            body.extend((chunk.len() as i32).to_le_bytes());
            body.extend(zlib(chunk));
        }
        let mut file = vec![];
        file.extend((chunks.len() as i32).to_le_bytes());
        for o in offsets {
            file.extend(o.to_le_bytes());
        }
        file.extend(body);
        file
    }

    #[test]
    fn test_pak_random_access() -> Result<()> {
        let chunks = vec![pattern(1000, 1), pattern(700, 2), pattern(1300, 3)];
        let expected: Vec<u8> = chunks.concat();
        let mut stream = ChunkStream::pak(Cursor::new(pak(&chunks)))?;
        assert_eq!(stream.len(), 3000);
        assert_eq!(stream.chunks()[2].dest_address, 1700);

        // read spanning the first two chunks
        stream.seek(SeekFrom::Start(900))?;
        let mut buf = vec![0; 300];
        stream.read_exact(&mut buf)?;
        assert_eq!(buf, expected[900..1200]);
        assert_eq!(stream.stream_position()?, 1200);

        // backward seek into a previous chunk
        stream.seek(SeekFrom::Start(10))?;
        let mut buf = vec![0; 50];
        stream.read_exact(&mut buf)?;
        assert_eq!(buf, expected[10..60]);

        // everything from the middle of the last chunk to the end
        stream.seek(SeekFrom::End(-100))?;
        let mut tail = vec![];
        stream.read_to_end(&mut tail)?;
        assert_eq!(tail, expected[2900..]);

        stream.seek(SeekFrom::Start(0))?;
        let mut all = vec![];
        stream.read_to_end(&mut all)?;
        assert_eq!(all, expected);
        Ok(())
    }

    #[test]
    fn test_seek_bounds() -> Result<()> {
        let mut stream = ChunkStream::pak(Cursor::new(pak(&[pattern(10, 0)])))?;
        let err = stream.seek(SeekFrom::Start(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(stream.seek(SeekFrom::Current(-1)).unwrap_err().kind(), io::ErrorKind::InvalidInput);
        assert_eq!(stream.seek(SeekFrom::Start(9))?, 9);
        Ok(())
    }

    #[test]
    fn test_pak_lzx_rejected() {
        let mut file = pak(&[pattern(16, 0)]);
        // uncompressed size field of the only chunk
        file[8..12].copy_from_slice(&(-5i32).to_le_bytes());
        let err = ChunkStream::pak(Cursor::new(file)).err().unwrap();
        assert!(matches!(crate::error::find(&err), Some(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_mcc_compressed() -> Result<()> {
        let header = pattern(64, 9);
        let compressed = pattern(200, 4);
        let stored = pattern(50, 7);

        let mut file = header.clone();
        let table = file.len();
        file.extend([0; 16]);

        let zlib_at = file.len();
        let zlib_body = zlib(&compressed);
        file.extend(&zlib_body);
        let stored_at = file.len();
        file.extend([0xAA, 0xBB]);
        file.extend(&stored);

        file[table..table + 4].copy_from_slice(&(zlib_body.len() as i32).to_le_bytes());
        file[table + 4..table + 8].copy_from_slice(&(zlib_at as i32).to_le_bytes());
        file[table + 8..table + 12].copy_from_slice(&(-(stored.len() as i32)).to_le_bytes());
        file[table + 12..table + 16].copy_from_slice(&(stored_at as i32).to_le_bytes());

        let layout = McCompressedLayout {
            header_size: 64,
            chunk_count: 2,
            chunk_table_address: table as u64,
            chunk_size: 0x1000,
        };
        let mut stream = ChunkStream::mcc_compressed(Cursor::new(file), &layout)?;
        assert_eq!(stream.len(), 64 + 200 + 50);
        assert_eq!(stream.chunks()[1].uncompressed_size, 200);
        assert_eq!(stream.chunks()[2].compressed_size, None);

        let mut all = vec![];
        stream.read_to_end(&mut all)?;
        assert_eq!(all, [header, compressed, stored.clone()].concat());

        stream.seek(SeekFrom::Start(64 + 200 + 10))?;
        let mut buf = [0; 5];
        stream.read_exact(&mut buf)?;
        assert_eq!(buf, stored[10..15]);
        Ok(())
    }
}
