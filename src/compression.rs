use anyhow::{Result, bail};
use std::io::Read as _;
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum CompressionMethod {
    Zlib,
    Oodle,
}

/// Fixture encoder for tests; the readers only ever decompress.
#[cfg(test)]
pub(crate) fn compress<S: std::io::Write>(compression: CompressionMethod, input: &[u8], output: S) -> Result<()> {
    use std::io::Write as _;
    match compression {
        CompressionMethod::Zlib => {
            let mut encoder = flate2::write::ZlibEncoder::new(output, flate2::Compression::best());
            encoder.write_all(input)?;
            encoder.finish()?;
        }
        CompressionMethod::Oodle => bail!("Oodle fixtures are not supported"),
    }
    Ok(())
}

/// Decompresses exactly `output_len` bytes; producing fewer is an error.
pub fn decompress(compression: CompressionMethod, input: &[u8], output_len: usize) -> Result<Vec<u8>> {
    match compression {
        CompressionMethod::Zlib => {
            let output = inflate_to_end(input, output_len)?;
            if output.len() != output_len {
                bail!("zlib stream produced {} of {output_len} bytes", output.len());
            }
            Ok(output)
        }
        CompressionMethod::Oodle => {
            let mut output = vec![0; output_len];
            let status = oodle_loader::oodle()?.decompress(input, &mut output);
            if status < 0 || status as usize != output.len() {
                bail!(
                    "Oodle decompression failed: expected {} output bytes, got {}",
                    output.len(),
                    status,
                );
            }
            Ok(output)
        }
    }
}

/// Inflates a zlib stream to its end, reading at most `limit` bytes of output.
pub fn inflate_to_end(input: impl std::io::Read, limit: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(limit.min(crate::endian::PREALLOC_LIMIT * 16));
    flate2::read::ZlibDecoder::new(input)
        .take(limit as u64)
        .read_to_end(&mut output)?;
    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_zlib() -> Result<()> {
        let input: Vec<u8> = (0..1000u32).flat_map(|i| (i % 7).to_le_bytes()).collect();
        let mut compressed = vec![];
        compress(CompressionMethod::Zlib, &input, &mut compressed)?;
        assert_eq!(decompress(CompressionMethod::Zlib, &compressed, input.len())?, input);
        assert_eq!(inflate_to_end(compressed.as_slice(), usize::MAX)?, input);
        assert!(decompress(CompressionMethod::Zlib, &compressed, input.len() + 1).is_err());
        Ok(())
    }
}
