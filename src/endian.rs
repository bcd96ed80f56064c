use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BE, LE, ReadBytesExt, WriteBytesExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }
    pub fn swap(self) -> Self {
        match self {
            ByteOrder::LittleEndian => ByteOrder::BigEndian,
            ByteOrder::BigEndian => ByteOrder::LittleEndian,
        }
    }
}

/// Upper bound on capacity reserved up front for counts read from a file.
/// Larger collections grow as their elements are actually read.
pub const PREALLOC_LIMIT: usize = 0x1000;

/// Reads exactly `len` bytes without trusting `len` for the allocation.
pub fn read_exact_vec(reader: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(PREALLOC_LIMIT * 16));
    reader.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", buf.len()),
        ));
    }
    Ok(buf)
}

/// Fixed-width value that can be read or written in either byte order.
pub trait Primitive: Sized + Copy {
    const SIZE: usize;
    fn read_from<R: Read>(stream: &mut R, order: ByteOrder) -> io::Result<Self>;
    fn write_to<W: Write>(self, stream: &mut W, order: ByteOrder) -> io::Result<()>;
}

impl Primitive for u8 {
    const SIZE: usize = 1;
    fn read_from<R: Read>(stream: &mut R, _order: ByteOrder) -> io::Result<Self> {
        stream.read_u8()
    }
    fn write_to<W: Write>(self, stream: &mut W, _order: ByteOrder) -> io::Result<()> {
        stream.write_u8(self)
    }
}
impl Primitive for i8 {
    const SIZE: usize = 1;
    fn read_from<R: Read>(stream: &mut R, _order: ByteOrder) -> io::Result<Self> {
        stream.read_i8()
    }
    fn write_to<W: Write>(self, stream: &mut W, _order: ByteOrder) -> io::Result<()> {
        stream.write_i8(self)
    }
}

macro_rules! primitive {
    ($ty:ty, $read:ident, $write:ident) => {
        impl Primitive for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn read_from<R: Read>(stream: &mut R, order: ByteOrder) -> io::Result<Self> {
                match order {
                    ByteOrder::LittleEndian => stream.$read::<LE>(),
                    ByteOrder::BigEndian => stream.$read::<BE>(),
                }
            }
            fn write_to<W: Write>(self, stream: &mut W, order: ByteOrder) -> io::Result<()> {
                match order {
                    ByteOrder::LittleEndian => stream.$write::<LE>(self),
                    ByteOrder::BigEndian => stream.$write::<BE>(self),
                }
            }
        }
    };
}

primitive!(u16, read_u16, write_u16);
primitive!(i16, read_i16, write_i16);
primitive!(u32, read_u32, write_u32);
primitive!(i32, read_i32, write_i32);
primitive!(u64, read_u64, write_u64);
primitive!(i64, read_i64, write_i64);
primitive!(f32, read_f32, write_f32);
primitive!(f64, read_f64, write_f64);

/// Object-safe `Read + Seek`, used where readers are type-erased.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Byte-order aware reader over a seekable stream.
///
/// Positions are relative to `origin`. A reader created by
/// [`EndianReader::create_virtual_reader`] borrows the same stream, so
/// both observe the same underlying cursor.
pub struct EndianReader<R> {
    inner: R,
    order: ByteOrder,
    origin: u64,
}

impl<R: Read + Seek> EndianReader<R> {
    pub fn new(inner: R, order: ByteOrder) -> Self {
        Self {
            inner,
            order,
            origin: 0,
        }
    }
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }
    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.order = order;
    }
    pub fn origin(&self) -> u64 {
        self.origin
    }
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn position(&mut self) -> io::Result<u64> {
        let absolute = self.inner.stream_position()?;
        absolute.checked_sub(self.origin).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("stream position {absolute:#x} is before reader origin {:#x}", self.origin),
            )
        })
    }
    pub fn seek(&mut self, position: u64) -> io::Result<u64> {
        self.inner.seek(SeekFrom::Start(self.origin + position))?;
        Ok(position)
    }
    pub fn seek_relative(&mut self, offset: i64) -> io::Result<()> {
        self.inner.seek_relative(offset)
    }

    pub fn read<T: Primitive>(&mut self) -> io::Result<T> {
        T::read_from(&mut self.inner, self.order)
    }
    pub fn read_in<T: Primitive>(&mut self, order: ByteOrder) -> io::Result<T> {
        T::read_from(&mut self.inner, order)
    }
    pub fn peek<T: Primitive>(&mut self) -> io::Result<T> {
        let start = self.inner.stream_position()?;
        let value = self.read();
        self.inner.seek(SeekFrom::Start(start))?;
        value
    }
    pub fn read_array<T: Primitive>(&mut self, count: usize) -> io::Result<Vec<T>> {
        let mut array = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for _ in 0..count {
            array.push(self.read()?);
        }
        Ok(array)
    }
    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        read_exact_vec(&mut self.inner, len)
    }

    /// Reads exactly `len` bytes, keeping everything before the first NUL.
    pub fn read_fixed_string(&mut self, len: usize) -> io::Result<String> {
        let buf = self.read_bytes(len)?;
        let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Reads until a NUL terminator, or until `max_length` bytes have been
    /// consumed when a limit is given.
    pub fn read_null_terminated_string(&mut self, max_length: Option<usize>) -> io::Result<String> {
        let mut buf = Vec::new();
        loop {
            if max_length.is_some_and(|max| buf.len() >= max) {
                break;
            }
            match self.inner.read_u8()? {
                0 => break,
                c => buf.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn create_virtual_reader(&mut self, origin: u64) -> EndianReader<&mut R> {
        EndianReader {
            inner: &mut self.inner,
            order: self.order,
            origin: self.origin + origin,
        }
    }
}

impl<R: ReadSeek> EndianReader<R> {
    /// Borrow this reader with the stream type erased.
    pub fn by_ref_dyn(&mut self) -> EndianReader<&mut dyn ReadSeek> {
        EndianReader {
            inner: &mut self.inner as &mut dyn ReadSeek,
            order: self.order,
            origin: self.origin,
        }
    }
}

/// Byte-order aware writer, independent of any reader over the same data.
pub struct EndianWriter<W> {
    inner: W,
    order: ByteOrder,
}

impl<W: Write + Seek> EndianWriter<W> {
    pub fn new(inner: W, order: ByteOrder) -> Self {
        Self { inner, order }
    }
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }
    pub fn set_byte_order(&mut self, order: ByteOrder) {
        self.order = order;
    }
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
    pub fn into_inner(self) -> W {
        self.inner
    }
    pub fn position(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }
    pub fn seek(&mut self, position: u64) -> io::Result<u64> {
        self.inner.seek(SeekFrom::Start(position))
    }
    pub fn write<T: Primitive>(&mut self, value: T) -> io::Result<()> {
        value.write_to(&mut self.inner, self.order)
    }
    pub fn write_in<T: Primitive>(&mut self, value: T, order: ByteOrder) -> io::Result<()> {
        value.write_to(&mut self.inner, order)
    }
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }
    pub fn write_null_terminated_string(&mut self, value: &str) -> io::Result<()> {
        self.inner.write_all(value.as_bytes())?;
        self.inner.write_u8(0)
    }
    /// Writes `value` padded with NULs (or truncated) to exactly `len` bytes.
    pub fn write_fixed_string(&mut self, value: &str, len: usize) -> io::Result<()> {
        let mut buf = value.as_bytes().to_vec();
        buf.resize(len, 0);
        self.inner.write_all(&buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn round_trip<T: Primitive + PartialEq + std::fmt::Debug>(value: T) {
        for order in [ByteOrder::LittleEndian, ByteOrder::BigEndian] {
            let mut writer = EndianWriter::new(Cursor::new(vec![]), order);
            writer.write(value).unwrap();
            let buf = writer.into_inner().into_inner();
            assert_eq!(buf.len(), T::SIZE);

            let mut reader = EndianReader::new(Cursor::new(buf.clone()), order);
            assert_eq!(reader.read::<T>().unwrap(), value);

            // the opposite order sees the bytes reversed
            let mut reversed = buf;
            reversed.reverse();
            let mut reader = EndianReader::new(Cursor::new(reversed), order.swap());
            assert_eq!(reader.read::<T>().unwrap(), value);
        }
    }

    #[test]
    fn test_round_trip() {
        round_trip(0x7fu8);
        round_trip(-5i8);
        round_trip(0x1234u16);
        round_trip(-1234i16);
        round_trip(0xdeadbeefu32);
        round_trip(-123456789i32);
        round_trip(0x0123456789abcdefu64);
        round_trip(-0x0123456789abcdefi64);
        round_trip(1.5f32);
        round_trip(-2.25f64);
    }

    #[test]
    fn test_opposite_order() {
        let mut writer = EndianWriter::new(Cursor::new(vec![]), ByteOrder::LittleEndian);
        writer.write(0x0100u16).unwrap();
        let buf = writer.into_inner().into_inner();

        let mut reader = EndianReader::new(Cursor::new(buf), ByteOrder::BigEndian);
        assert_eq!(reader.read::<u16>().unwrap(), 0x0001);
    }

    #[test]
    fn test_independent_orders_same_stream() {
        let mut stream = Cursor::new(vec![0u8; 8]);
        {
            let mut writer = EndianWriter::new(&mut stream, ByteOrder::BigEndian);
            writer.write(0x11223344u32).unwrap();
        }
        stream.set_position(0);
        let mut reader = EndianReader::new(&mut stream, ByteOrder::LittleEndian);
        assert_eq!(reader.read::<u32>().unwrap(), 0x44332211);
    }

    #[test]
    fn test_peek_and_strings() {
        let data = b"\x2a\x00\x00\x00abc\0defghij\0\0\0".to_vec();
        let mut reader = EndianReader::new(Cursor::new(data), ByteOrder::LittleEndian);
        assert_eq!(reader.peek::<i32>().unwrap(), 42);
        assert_eq!(reader.position().unwrap(), 0);
        reader.seek(4).unwrap();
        assert_eq!(reader.read_null_terminated_string(None).unwrap(), "abc");
        assert_eq!(reader.read_null_terminated_string(Some(4)).unwrap(), "defg");
        assert_eq!(reader.read_fixed_string(6).unwrap(), "hij");
    }

    #[test]
    fn test_virtual_reader_shares_position() {
        let data: Vec<u8> = (0..32).collect();
        let mut reader = EndianReader::new(Cursor::new(data), ByteOrder::LittleEndian);
        {
            let mut virt = reader.create_virtual_reader(16);
            virt.seek(2).unwrap();
            assert_eq!(virt.read::<u8>().unwrap(), 18);
            assert_eq!(virt.position().unwrap(), 3);

            let mut nested = virt.create_virtual_reader(4);
            nested.seek(0).unwrap();
            assert_eq!(nested.read::<u8>().unwrap(), 20);
        }
        assert_eq!(reader.position().unwrap(), 21);
    }

    #[test]
    fn test_eof_is_io_error() {
        let mut reader = EndianReader::new(Cursor::new(vec![1u8, 2]), ByteOrder::LittleEndian);
        let err = reader.read::<u32>().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let mut reader = EndianReader::new(Cursor::new(b"abc".to_vec()), ByteOrder::LittleEndian);
        assert!(reader.read_null_terminated_string(None).is_err());
    }

    #[test]
    fn test_huge_counts_fail_without_allocating() {
        let mut reader = EndianReader::new(Cursor::new(vec![0u8; 16]), ByteOrder::LittleEndian);
        let err = reader.read_array::<u64>(0x7fff_ffff).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        reader.seek(0).unwrap();
        let err = reader.read_bytes(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        reader.seek(0).unwrap();
        assert_eq!(reader.read_bytes(16).unwrap().len(), 16);
    }
}
