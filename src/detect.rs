use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use crate::cache_type::{CacheMetadata, CacheType, is_build_date};
use crate::endian::{ByteOrder, EndianReader};
use crate::error::Error;

/// `head` read as a little endian i32.
pub const LITTLE_HEADER: i32 = 0x68656164;
/// `head` written big endian, read as a little endian i32.
pub const BIG_HEADER: i32 = 0x64616568;

static BUILD_STRING: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9\. _:]{10,32}").unwrap());

/// Result of sniffing a cache file's signature and build string.
#[derive(Debug, Clone)]
pub struct CacheArgs {
    pub path: Option<PathBuf>,
    pub byte_order: ByteOrder,
    pub version: i32,
    pub build_string: String,
    pub metadata: Option<CacheMetadata>,
}

impl CacheArgs {
    pub fn cache_type(&self) -> CacheType {
        self.metadata.as_ref().map_or(CacheType::Unknown, |m| m.cache_type)
    }

    #[instrument(skip_all, name = "detect")]
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }
        let file = std::io::BufReader::new(fs_err::File::open(path)?);
        Self::detect(file, Some(path)).with_context(|| format!("detecting {}", path.display()))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        Self::detect(reader, None)
    }

    fn detect<R: Read + Seek>(stream: R, path: Option<&Path>) -> Result<Self> {
        let mut reader = EndianReader::new(stream, ByteOrder::LittleEndian);
        match reader.read::<i32>()? {
            LITTLE_HEADER => {}
            BIG_HEADER => reader.set_byte_order(ByteOrder::BigEndian),
            _ => return Err(Error::NotAValidArchive.into()),
        }
        let version = reader.read::<i32>()?;
        let address = build_string_address(&mut reader, version)?;

        reader.seek(address)?;
        let build_string = reader.read_null_terminated_string(Some(32))?;
        debug!("found build string {build_string:?} at {address}");

        Ok(Self {
            path: path.map(Path::to_path_buf),
            byte_order: reader.byte_order(),
            version,
            metadata: CacheMetadata::from_build_string(&build_string, path),
            build_string,
        })
    }
}

fn build_string_address<R: Read + Seek>(reader: &mut EndianReader<R>, version: i32) -> Result<u64> {
    Ok(match version {
        // Halo 1 Xbox, PC and CE
        5 | 6 | 7 | 609 => 64,
        8 => {
            reader.seek(36)?;
            match reader.read::<i32>()? {
                0 => 288,
                -1 => 300,
                _ => return Err(Error::NotAValidArchive.into()),
            }
        }
        13 => {
            reader.seek(64)?;
            if reader.peek::<i32>()? == 0 {
                288
            } else if BUILD_STRING.is_match(&reader.read_null_terminated_string(Some(32))?) {
                64
            } else {
                reader.seek(160)?;
                if is_build_date(&reader.read_null_terminated_string(Some(32))?) {
                    160
                } else {
                    152
                }
            }
        }
        _ if reader.byte_order() == ByteOrder::LittleEndian => 288,
        _ => 284,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{ErrorKind, kind};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn header(magic: i32, version: i32, order: ByteOrder) -> Vec<u8> {
        let mut data = vec![0u8; 0x800];
        let (magic, version) = match order {
            ByteOrder::LittleEndian => (magic.to_le_bytes(), version.to_le_bytes()),
            ByteOrder::BigEndian => (magic.to_be_bytes(), version.to_be_bytes()),
        };
        data[0..4].copy_from_slice(&magic);
        data[4..8].copy_from_slice(&version);
        data
    }

    fn put(data: &mut [u8], at: usize, bytes: &[u8]) {
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn test_unknown_signature() {
        let err = CacheArgs::from_reader(Cursor::new(vec![0u8; 64])).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::Format));
        assert!(matches!(crate::error::find(&err), Some(Error::NotAValidArchive)));
    }

    #[test]
    fn test_console_retail() -> Result<()> {
        // big endian "head" reads as BIG_HEADER little endian
        let mut data = header(LITTLE_HEADER, 11, ByteOrder::BigEndian);
        put(&mut data, 284, b"11855.07.08.20.2317.halo3_ship\0");
        let args = CacheArgs::from_reader(Cursor::new(data))?;
        assert_eq!(args.byte_order, ByteOrder::BigEndian);
        assert_eq!(args.version, 11);
        assert_eq!(args.cache_type(), CacheType::Halo3Retail);
        Ok(())
    }

    #[test]
    fn test_version_8() -> Result<()> {
        let mut data = header(LITTLE_HEADER, 8, ByteOrder::LittleEndian);
        put(&mut data, 288, b"02.09.27.09809\0");
        assert_eq!(CacheArgs::from_reader(Cursor::new(data.clone()))?.cache_type(), CacheType::Halo2Xbox);

        put(&mut data, 36, &(-1i32).to_le_bytes());
        put(&mut data, 300, b"11081.07.04.30.0934.main\0");
        assert_eq!(CacheArgs::from_reader(Cursor::new(data.clone()))?.cache_type(), CacheType::Halo2Vista);

        put(&mut data, 36, &5i32.to_le_bytes());
        assert!(CacheArgs::from_reader(Cursor::new(data)).is_err());
        Ok(())
    }

    #[test]
    fn test_version_13() -> Result<()> {
        // padding at 64: build string at 288
        let mut data = header(LITTLE_HEADER, 13, ByteOrder::LittleEndian);
        put(&mut data, 288, b"Jun 25 2020 15:02:49\0");
        let args = CacheArgs::from_reader(Cursor::new(data))?;
        assert_eq!(args.build_string, "Jun 25 2020 15:02:49");
        assert_eq!(args.cache_type(), CacheType::MccHalo3);

        // build-like string at 64
        let mut data = header(LITTLE_HEADER, 13, ByteOrder::LittleEndian);
        put(&mut data, 64, b"01.03.43.0000\0");
        assert_eq!(CacheArgs::from_reader(Cursor::new(data))?.cache_type(), CacheType::MccHalo1);

        // neither: date at 160
        let mut data = header(LITTLE_HEADER, 13, ByteOrder::LittleEndian);
        put(&mut data, 64, b"\x01\x02\x03\0");
        put(&mut data, 160, b"Oct 11 2022 04:34:53\0");
        assert_eq!(CacheArgs::from_reader(Cursor::new(data))?.cache_type(), CacheType::MccHalo3U12);

        // otherwise 152
        let mut data = header(LITTLE_HEADER, 13, ByteOrder::LittleEndian);
        put(&mut data, 64, b"\x01\x02\x03\0");
        put(&mut data, 152, b"Oct 17 2022 21:26:14\0");
        let args = CacheArgs::from_reader(Cursor::new(data))?;
        assert_eq!(args.cache_type(), CacheType::MccHalo4U6);
        Ok(())
    }

    #[test]
    fn test_unknown_build() -> Result<()> {
        let mut data = header(LITTLE_HEADER, 11, ByteOrder::LittleEndian);
        put(&mut data, 288, b"not a real build\0");
        let args = CacheArgs::from_reader(Cursor::new(data))?;
        assert_eq!(args.cache_type(), CacheType::Unknown);
        assert_eq!(args.metadata, None);
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = CacheArgs::from_path("/nonexistent/blamcache/test.map").unwrap_err();
        assert!(matches!(crate::error::find(&err), Some(Error::FileNotFound(_))));
    }
}
