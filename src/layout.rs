//! Declarative, version-aware object layouts.
//!
//! A type describes where its fields live by implementing [`Layout`]. The
//! description is built once per type, validated and cached in a process-wide
//! registry. Reading an object then selects the variant matching the requested
//! version and reads each field relative to the object's origin.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{Deref, Range, RangeFrom, RangeFull, RangeTo};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::address::Translator;
use crate::endian::{ByteOrder, PREALLOC_LIMIT, Primitive};
use crate::error::Error;
use crate::pointer::{Pointer, Pointer64, PointerExpander};
use crate::reader::{Dependencies, ReadContext};

/// Half-open range `[min, max)` of layout versions.
///
/// `min == max` selects exactly that version and a missing bound is unbounded.
/// An unversioned request only matches a fully unbounded range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Option<i32>,
    pub max: Option<i32>,
}

impl VersionRange {
    pub const ANY: VersionRange = VersionRange { min: None, max: None };

    pub fn new(min: Option<i32>, max: Option<i32>) -> Self {
        Self { min, max }
    }
    pub fn exact(version: impl Into<i32>) -> Self {
        let v = version.into();
        Self::new(Some(v), Some(v))
    }
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, version: Option<i32>) -> bool {
        let Some(v) = version else {
            return self.is_unbounded();
        };
        match (self.min, self.max) {
            (Some(min), Some(max)) if min == max => v == min,
            (min, max) => min.is_none_or(|min| v >= min) && max.is_none_or(|max| v < max),
        }
    }

    /// Inclusive bounds widened to i64 so the exact form and open ends compare uniformly.
    fn bounds(&self) -> (i64, i64) {
        match (self.min, self.max) {
            (Some(min), Some(max)) if min == max => (min as i64, min as i64),
            (min, max) => (
                min.map_or(i64::MIN, i64::from),
                max.map_or(i64::MAX, |max| max as i64 - 1),
            ),
        }
    }

    pub fn overlaps(&self, other: &VersionRange) -> bool {
        let (a_min, a_max) = self.bounds();
        let (b_min, b_max) = other.bounds();
        // an unversioned request matches both fully unbounded ranges
        (self.is_unbounded() && other.is_unbounded()) || (a_min <= a_max && b_min <= b_max && a_min <= b_max && b_min <= a_max)
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bound = |b: Option<i32>| b.map_or_else(|| "-".to_string(), |b| b.to_string());
        write!(f, "[{}, {})", bound(self.min), bound(self.max))
    }
}

impl<T: Into<i32>> From<Range<T>> for VersionRange {
    fn from(range: Range<T>) -> Self {
        Self::new(Some(range.start.into()), Some(range.end.into()))
    }
}
impl<T: Into<i32>> From<RangeFrom<T>> for VersionRange {
    fn from(range: RangeFrom<T>) -> Self {
        Self::new(Some(range.start.into()), None)
    }
}
impl<T: Into<i32>> From<RangeTo<T>> for VersionRange {
    fn from(range: RangeTo<T>) -> Self {
        Self::new(None, Some(range.end.into()))
    }
}
impl From<RangeFull> for VersionRange {
    fn from(_: RangeFull) -> Self {
        Self::ANY
    }
}

/// Position of a field relative to its object, optionally restricted to a
/// version range within the variant and read with a fixed byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    offset: u64,
    range: VersionRange,
    order: Option<ByteOrder>,
}

impl Offset {
    pub fn at(offset: u64) -> Self {
        Self {
            offset,
            range: VersionRange::ANY,
            order: None,
        }
    }
    pub fn min(mut self, version: impl Into<i32>) -> Self {
        self.range.min = Some(version.into());
        self
    }
    pub fn max(mut self, version: impl Into<i32>) -> Self {
        self.range.max = Some(version.into());
        self
    }
    pub fn exact(mut self, version: impl Into<i32>) -> Self {
        self.range = VersionRange::exact(version);
        self
    }
    pub fn order(mut self, order: ByteOrder) -> Self {
        self.order = Some(order);
        self
    }
}

impl From<u64> for Offset {
    fn from(offset: u64) -> Self {
        Offset::at(offset)
    }
}
impl From<u32> for Offset {
    fn from(offset: u32) -> Self {
        Offset::at(offset as u64)
    }
}
impl TryFrom<i32> for Offset {
    type Error = Error;

    fn try_from(offset: i32) -> Result<Self, Error> {
        u64::try_from(offset).map(Offset::at).map_err(|_| Error::InvalidValue {
            what: "field offset",
            value: offset as i64,
        })
    }
}

/// Anything a field position can be declared with. Unsuffixed literals are
/// `i32`, so negative values are rejected when the definition is built.
pub trait IntoOffset {
    fn into_offset(self) -> Result<Offset, Error>;
}
impl IntoOffset for Offset {
    fn into_offset(self) -> Result<Offset, Error> {
        Ok(self)
    }
}
impl IntoOffset for u64 {
    fn into_offset(self) -> Result<Offset, Error> {
        Ok(self.into())
    }
}
impl IntoOffset for u32 {
    fn into_offset(self) -> Result<Offset, Error> {
        Ok(self.into())
    }
}
impl IntoOffset for i32 {
    fn into_offset(self) -> Result<Offset, Error> {
        self.try_into()
    }
}

/// A value that can be read directly at a field position.
pub trait FieldValue: Sized + Send + Sync + 'static {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self>;
}

macro_rules! primitive_field {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for $ty {
                fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
                    ctx.read::<$ty>(order)
                }
            }
        )*
    };
}
primitive_field!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl FieldValue for bool {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        Ok(ctx.read::<u8>(order)? != 0)
    }
}

impl<T: FieldValue + Primitive + Default, const N: usize> FieldValue for [T; N] {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let mut values = [T::default(); N];
        for value in &mut values {
            *value = T::read_field(ctx, order)?;
        }
        Ok(values)
    }
}

impl FieldValue for Pointer {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let value = ctx.read::<i32>(order)?;
        let translator = ctx.deps().require::<Translator>()?;
        Ok(match ctx.deps().get::<PointerExpander>() {
            Some(expander) => Pointer::with_expander(value, translator, expander),
            None => Pointer::new(value, translator),
        })
    }
}

impl FieldValue for Pointer64 {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let value = ctx.read::<i64>(order)?;
        Ok(Pointer64::new(value, ctx.deps().require::<Translator>()?))
    }
}

/// Counted array of fixed-size elements stored elsewhere in the file,
/// serialized as an i32 count followed by a [`Pointer`].
#[derive(Clone)]
pub struct Block<T> {
    items: Vec<T>,
    pointer: Pointer,
}

impl<T> Block<T> {
    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for Block<T> {
    fn default() -> Self {
        Self {
            items: vec![],
            pointer: Pointer::default(),
        }
    }
}

impl<T> Deref for Block<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<'a, T> IntoIterator for &'a Block<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Debug> Debug for Block<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("pointer", &self.pointer)
            .field("items", &self.items)
            .finish()
    }
}

impl<T: Layout> FieldValue for Block<T> {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let count = ctx.read::<i32>(order)?;
        let pointer = Pointer::read_field(ctx, order)?;
        if count < 0 {
            return Err(Error::InvalidValue {
                what: "block count",
                value: count as i64,
            }
            .into());
        }
        if count == 0 {
            return Ok(Block { items: vec![], pointer });
        }

        let address = pointer.address();
        let start = u64::try_from(address).map_err(|_| Error::InvalidValue {
            what: "block address",
            value: address,
        })?;
        let size = definition::<T>()?.select(ctx.version())?.fixed_size();
        let size = match size {
            Some(size) => size,
            None if count == 1 => 0,
            None => return Err(Error::MissingSize(type_name::<T>()).into()),
        };

        let mut items = Vec::with_capacity((count as usize).min(PREALLOC_LIMIT));
        for i in 0..count as u64 {
            items.push(ctx.read_object_at(start + i * size)?);
        }
        Ok(Block { items, pointer })
    }
}

/// A type with a declarative binary layout.
pub trait Layout: Default + Send + Sync + 'static {
    fn define(def: &mut Definition<Self>);

    /// Called on the default-constructed value before any field is read.
    fn bind(&mut self, deps: &Dependencies) -> Result<()> {
        let _ = deps;
        Ok(())
    }
}

type ReadFn<T> = Box<dyn Fn(&mut T, &mut ReadContext<'_, '_>, ByteOrder) -> Result<()> + Send + Sync>;

pub struct FieldDef<T> {
    offset: Offset,
    read: ReadFn<T>,
}

impl<T> FieldDef<T> {
    pub fn offset(&self) -> u64 {
        self.offset.offset
    }
    pub fn range(&self) -> VersionRange {
        self.offset.range
    }
    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.offset.order
    }
    pub fn read(&self, target: &mut T, ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<()> {
        (self.read)(target, ctx, order)
    }
}

/// One layout variant of a type, valid for a range of versions.
pub struct VersionBuilder<T> {
    range: VersionRange,
    size: Option<u64>,
    order: Option<ByteOrder>,
    fields: Vec<FieldDef<T>>,
    invalid: Option<Error>,
}

impl<T: 'static> VersionBuilder<T> {
    pub fn range(&self) -> VersionRange {
        self.range
    }
    pub fn fixed_size(&self) -> Option<u64> {
        self.size
    }
    pub fn order_override(&self) -> Option<ByteOrder> {
        self.order
    }
    pub fn fields(&self) -> &[FieldDef<T>] {
        &self.fields
    }

    pub fn size(&mut self, size: u64) -> &mut Self {
        self.size = Some(size);
        self
    }
    pub fn byte_order(&mut self, order: ByteOrder) -> &mut Self {
        self.order = Some(order);
        self
    }

    /// Custom read hook at `offset`.
    pub fn with(
        &mut self,
        offset: impl IntoOffset,
        read: impl Fn(&mut T, &mut ReadContext<'_, '_>, ByteOrder) -> Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        match offset.into_offset() {
            Ok(offset) => self.fields.push(FieldDef {
                offset,
                read: Box::new(read),
            }),
            Err(err) => {
                self.invalid.get_or_insert(err);
            }
        }
        self
    }

    pub fn field<F: FieldValue>(&mut self, offset: impl IntoOffset, accessor: fn(&mut T) -> &mut F) -> &mut Self {
        self.with(offset, move |target, ctx, order| {
            *accessor(target) = F::read_field(ctx, order)?;
            Ok(())
        })
    }

    /// Field stored on disk as `W` but exposed as `F`.
    pub fn stored<W: FieldValue, F: From<W> + 'static>(
        &mut self,
        offset: impl IntoOffset,
        accessor: fn(&mut T) -> &mut F,
    ) -> &mut Self {
        self.with(offset, move |target, ctx, order| {
            *accessor(target) = F::from(W::read_field(ctx, order)?);
            Ok(())
        })
    }

    pub fn structure<S: Layout>(&mut self, offset: impl IntoOffset, accessor: fn(&mut T) -> &mut S) -> &mut Self {
        self.with(offset, move |target, ctx, _| {
            *accessor(target) = ctx.read_object::<S>()?;
            Ok(())
        })
    }

    pub fn block<S: Layout>(&mut self, offset: impl IntoOffset, accessor: fn(&mut T) -> &mut Block<S>) -> &mut Self {
        self.field(offset, accessor)
    }

    pub fn fixed_string(
        &mut self,
        offset: impl IntoOffset,
        len: usize,
        accessor: fn(&mut T) -> &mut String,
    ) -> &mut Self {
        self.with(offset, move |target, ctx, _| {
            *accessor(target) = ctx.reader().read_fixed_string(len)?;
            Ok(())
        })
    }

    pub fn null_terminated(
        &mut self,
        offset: impl IntoOffset,
        max: Option<usize>,
        accessor: fn(&mut T) -> &mut String,
    ) -> &mut Self {
        self.with(offset, move |target, ctx, _| {
            *accessor(target) = ctx.reader().read_null_terminated_string(max)?;
            Ok(())
        })
    }
}

/// All layout variants declared by a type.
pub struct Definition<T> {
    variants: Vec<VersionBuilder<T>>,
}

impl<T: Layout> Definition<T> {
    fn new() -> Self {
        Self { variants: vec![] }
    }

    pub fn version(&mut self, range: impl Into<VersionRange>) -> &mut VersionBuilder<T> {
        self.variants.push(VersionBuilder {
            range: range.into(),
            size: None,
            order: None,
            fields: vec![],
            invalid: None,
        });
        let last = self.variants.len() - 1;
        &mut self.variants[last]
    }

    /// Variant for layouts that do not vary by version.
    pub fn unversioned(&mut self) -> &mut VersionBuilder<T> {
        self.version(..)
    }

    pub fn variants(&self) -> &[VersionBuilder<T>] {
        &self.variants
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(err) = self.variants.iter_mut().find_map(|v| v.invalid.take()) {
            return Err(err.into());
        }
        for (i, a) in self.variants.iter().enumerate() {
            for b in &self.variants[i + 1..] {
                if a.range.overlaps(&b.range) {
                    return Err(Error::OverlappingLayout {
                        type_name: type_name::<T>(),
                        first: a.range.to_string(),
                        second: b.range.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn select(&self, version: Option<i32>) -> Result<&VersionBuilder<T>> {
        let mut matching = self.variants.iter().filter(|v| v.range.contains(version));
        match (matching.next(), matching.next()) {
            (Some(variant), None) => Ok(variant),
            (None, _) => Err(Error::NoLayout {
                type_name: type_name::<T>(),
                version,
            }
            .into()),
            (Some(_), Some(_)) => Err(Error::AmbiguousLayout {
                type_name: type_name::<T>(),
                version,
            }
            .into()),
        }
    }
}

type Registry = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(Default::default);

/// Cached, validated definition of `T`.
pub fn definition<T: Layout>() -> Result<Arc<Definition<T>>> {
    let key = TypeId::of::<T>();
    let cached = REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned();
    if let Some(cached) = cached.and_then(|c| c.downcast::<Definition<T>>().ok()) {
        return Ok(cached);
    }

    let mut def = Definition::new();
    T::define(&mut def);
    def.validate()?;

    let entry = REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key)
        .or_insert_with(|| Arc::new(def))
        .clone();
    entry
        .downcast::<Definition<T>>()
        .map_err(|_| anyhow::anyhow!("registry entry for {} has the wrong type", type_name::<T>()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{ErrorKind, kind};
    use crate::reader::DependencyReader;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn numbered(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i + 100) as u8).collect()
    }

    #[derive(Debug, Default, PartialEq)]
    struct Bucketed {
        a: u8,
        b: u8,
    }
    impl Layout for Bucketed {
        fn define(def: &mut Definition<Self>) {
            def.version(..2).field(0, |s| &mut s.a);
            def.version(2..4)
                .field(4, |s| &mut s.a)
                .field(Offset::at(8).min(3), |s| &mut s.b);
            def.version(4..).field(12, |s| &mut s.a);
        }
    }

    #[test]
    fn test_version_buckets() -> Result<()> {
        let mut reader = DependencyReader::new(Cursor::new(numbered(16)), ByteOrder::LittleEndian);
        let read = |reader: &mut DependencyReader<_>, v| reader.read_object_at::<Bucketed>(0, Some(v));
        assert_eq!(read(&mut reader, 1)?, Bucketed { a: 100, b: 0 });
        assert_eq!(read(&mut reader, 2)?, Bucketed { a: 104, b: 0 });
        assert_eq!(read(&mut reader, 3)?, Bucketed { a: 104, b: 108 });
        assert_eq!(read(&mut reader, 4)?, Bucketed { a: 112, b: 0 });

        let err = reader.read_object_at::<Bucketed>(0, None).unwrap_err();
        assert!(matches!(crate::error::find(&err), Some(Error::NoLayout { .. })));
        Ok(())
    }

    #[test]
    fn test_version_range() {
        let exact = VersionRange::exact(5);
        assert!(exact.contains(Some(5)));
        assert!(!exact.contains(Some(6)));
        assert!(!VersionRange::from(1..3).contains(Some(3)));
        assert!(VersionRange::from(1..3).contains(Some(1)));
        assert!(!VersionRange::from(1..).contains(None));
        assert!(VersionRange::ANY.contains(None));
        assert!(VersionRange::from(1..3).overlaps(&VersionRange::exact(2)));
        assert!(!VersionRange::from(1..3).overlaps(&VersionRange::from(3..)));
        assert!(VersionRange::from(..3).overlaps(&VersionRange::ANY));
        assert_eq!(VersionRange::from(..3).to_string(), "[-, 3)");
    }

    #[derive(Debug, Default)]
    struct Overlapping {
        _a: u8,
    }
    impl Layout for Overlapping {
        fn define(def: &mut Definition<Self>) {
            def.version(..5).field(0, |s| &mut s._a);
            def.version(4..).field(1, |s| &mut s._a);
        }
    }

    #[test]
    fn test_overlapping_variants() {
        let mut reader = DependencyReader::new(Cursor::new(numbered(4)), ByteOrder::LittleEndian);
        let err = reader.read_object::<Overlapping>(Some(1)).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::Configuration));
        assert!(matches!(
            crate::error::find(&err),
            Some(Error::OverlappingLayout { .. })
        ));
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Element {
        id: u16,
        value: i16,
    }
    impl Layout for Element {
        fn define(def: &mut Definition<Self>) {
            def.unversioned()
                .size(8)
                .field(0, |s| &mut s.id)
                .field(2, |s| &mut s.value);
        }
    }

    #[derive(Debug, Default)]
    struct Parent {
        elements: Block<Element>,
        wide: i64,
        big: u32,
        name: String,
        label: String,
    }
    impl Layout for Parent {
        fn define(def: &mut Definition<Self>) {
            def.unversioned()
                .size(40)
                .block(0, |s| &mut s.elements)
                .stored::<i32, _>(8, |s| &mut s.wide)
                .field(Offset::at(12).order(ByteOrder::BigEndian), |s| &mut s.big)
                .fixed_string(16, 8, |s| &mut s.name)
                .null_terminated(24, Some(16), |s| &mut s.label);
        }
    }

    fn parent_bytes(count: i32, pointer: i32) -> Vec<u8> {
        let mut data = vec![];
        data.extend(count.to_le_bytes());
        data.extend(pointer.to_le_bytes());
        data.extend((-2i32).to_le_bytes());
        data.extend(0x01020304u32.to_be_bytes());
        data.extend(b"name\0xyz");
        data.extend(b"label\0\0\0\0\0\0\0\0\0\0\0");
        for i in 0..3u16 {
            data.extend(i.to_le_bytes());
            data.extend((-(i as i16)).to_le_bytes());
            data.extend([0; 4]);
        }
        data
    }

    #[test]
    fn test_block_and_strings() -> Result<()> {
        // elements start at 40, stored as pointer 0x1040
        let mut reader = DependencyReader::new(Cursor::new(parent_bytes(3, 0x1028)), ByteOrder::LittleEndian);
        reader.register(Arc::new(Translator::magic(0x1000)));
        let parent: Parent = reader.read_object(None)?;
        assert_eq!(reader.position()?, 40);

        assert_eq!(
            parent.elements.to_vec(),
            vec![
                Element { id: 0, value: 0 },
                Element { id: 1, value: -1 },
                Element { id: 2, value: -2 },
            ]
        );
        assert_eq!(parent.elements.pointer().address(), 40);
        assert_eq!(parent.wide, -2);
        assert_eq!(parent.big, 0x01020304);
        assert_eq!(parent.name, "name");
        assert_eq!(parent.label, "label");
        Ok(())
    }

    #[test]
    fn test_empty_block_not_dereferenced() -> Result<()> {
        // pointer 0 translates to a negative address
        let mut reader = DependencyReader::new(Cursor::new(parent_bytes(0, 0)), ByteOrder::LittleEndian);
        reader.register(Arc::new(Translator::magic(0x1000)));
        let parent: Parent = reader.read_object(None)?;
        assert!(parent.elements.is_empty());
        assert_eq!(parent.elements.pointer().address(), -0x1000);
        Ok(())
    }

    #[test]
    fn test_huge_block_count() {
        let mut reader = DependencyReader::new(
            Cursor::new(parent_bytes(0x7fff_ffff, 0x1028)),
            ByteOrder::LittleEndian,
        );
        reader.register(Arc::new(Translator::magic(0x1000)));
        let err = reader.read_object::<Parent>(None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::Io));

        reader.seek(40).unwrap();
        let err = reader.read_array::<Element>(0x7fff_ffff, None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::Io));
    }

    #[test]
    fn test_expanded_block_pointer() -> Result<()> {
        let mut reader = DependencyReader::new(Cursor::new(parent_bytes(2, 0x40a)), ByteOrder::LittleEndian);
        reader
            .register(Arc::new(Translator::magic(0x1000)))
            .register(Arc::new(PointerExpander::new(0)));
        let parent: Parent = reader.read_object(None)?;
        assert_eq!(parent.elements.pointer().address(), 40);
        assert_eq!(parent.elements.len(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_dependency() {
        let mut reader = DependencyReader::new(Cursor::new(parent_bytes(1, 0)), ByteOrder::LittleEndian);
        let err = reader.read_object::<Parent>(None).unwrap_err();
        assert_eq!(kind(&err), Some(ErrorKind::Configuration));
        assert!(matches!(
            crate::error::find(&err),
            Some(Error::MissingDependency(name)) if name.ends_with("Translator")
        ));
    }

    #[test]
    fn test_read_array() -> Result<()> {
        let data = parent_bytes(0, 0);
        let mut reader = DependencyReader::new(Cursor::new(data), ByteOrder::LittleEndian);
        reader.seek(40)?;
        let items: Vec<Element> = reader.read_array(3, None)?;
        assert_eq!(items[2], Element { id: 2, value: -2 });
        assert_eq!(reader.position()?, 64);
        Ok(())
    }

    #[derive(Debug, Default)]
    struct Bound {
        magic: i64,
        value: u8,
    }
    impl Layout for Bound {
        fn define(def: &mut Definition<Self>) {
            def.unversioned().field(0, |s| &mut s.value);
        }
        fn bind(&mut self, deps: &Dependencies) -> Result<()> {
            self.magic = deps.require::<PointerExpander>()?.magic();
            Ok(())
        }
    }

    #[test]
    fn test_bind() -> Result<()> {
        let mut reader = DependencyReader::new(Cursor::new(numbered(1)), ByteOrder::LittleEndian);
        assert!(reader.read_object::<Bound>(None).is_err());
        reader.register(Arc::new(PointerExpander::new(7)));
        let bound: Bound = reader.read_object_at(0, None)?;
        assert_eq!((bound.magic, bound.value), (7, 100));
        Ok(())
    }

    #[derive(Debug, Default)]
    struct NegativeOffset {
        _a: u8,
    }
    impl Layout for NegativeOffset {
        fn define(def: &mut Definition<Self>) {
            def.unversioned().field(-4, |s| &mut s._a);
        }
    }

    #[test]
    fn test_negative_offset() {
        assert!(matches!(Offset::try_from(-1i32), Err(Error::InvalidValue { value: -1, .. })));
        assert_eq!(Offset::try_from(8i32).unwrap(), Offset::at(8));

        let mut reader = DependencyReader::new(Cursor::new(numbered(8)), ByteOrder::LittleEndian);
        let err = reader.read_object::<NegativeOffset>(None).unwrap_err();
        assert!(matches!(
            crate::error::find(&err),
            Some(Error::InvalidValue { what: "field offset", value: -4 })
        ));
    }
}
