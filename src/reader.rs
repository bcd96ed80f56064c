use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::endian::{ByteOrder, EndianReader, PREALLOC_LIMIT, Primitive, ReadSeek};
use crate::error::Error;
use crate::layout::{Layout, definition};

/// Context values available to fields while an object graph is read.
///
/// Values are keyed by their concrete type. Looking up a type that was never
/// registered through [`Dependencies::require`] is a configuration error.
#[derive(Clone, Default)]
pub struct Dependencies {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> &mut Self {
        self.values.insert(TypeId::of::<T>(), value);
        self
    }
    pub fn with<T: Any + Send + Sync>(mut self, value: Arc<T>) -> Self {
        self.register(value);
        self
    }
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.clone().downcast::<T>().ok())
    }
    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.get::<T>()
            .ok_or_else(|| Error::MissingDependency(type_name::<T>()).into())
    }
}

impl Debug for Dependencies {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("count", &self.values.len())
            .finish()
    }
}

/// Data block currently being read, for formats that address nested data
/// relative to the block containing a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataScope {
    pub block: i32,
    pub start: u64,
}

/// State threaded through one object read: the stream, the requested
/// version and the registered dependencies.
pub struct ReadContext<'r, 'd> {
    reader: EndianReader<&'r mut dyn ReadSeek>,
    version: Option<i32>,
    deps: &'d Dependencies,
    scope: Option<DataScope>,
}

impl<'r, 'd> ReadContext<'r, 'd> {
    pub fn new(reader: EndianReader<&'r mut dyn ReadSeek>, version: Option<i32>, deps: &'d Dependencies) -> Self {
        Self {
            reader,
            version,
            deps,
            scope: None,
        }
    }
    pub fn reader(&mut self) -> &mut EndianReader<&'r mut dyn ReadSeek> {
        &mut self.reader
    }
    pub fn version(&self) -> Option<i32> {
        self.version
    }
    pub fn deps(&self) -> &'d Dependencies {
        self.deps
    }
    pub fn scope(&self) -> Option<DataScope> {
        self.scope
    }
    /// Replace the data scope, returning the previous one.
    pub fn set_scope(&mut self, scope: Option<DataScope>) -> Option<DataScope> {
        std::mem::replace(&mut self.scope, scope)
    }
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.reader.position()?)
    }
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.reader.seek(position)?;
        Ok(())
    }
    pub fn read<T: Primitive>(&mut self, order: ByteOrder) -> Result<T> {
        Ok(self.reader.read_in(order)?)
    }

    /// Reads `T` at the current position using the layout variant for this
    /// context's version.
    pub fn read_object<T: Layout>(&mut self) -> Result<T> {
        let definition = definition::<T>()?;
        let variant = definition.select(self.version)?;
        let origin = self.reader.position()?;

        let mut target = T::default();
        target.bind(self.deps)?;

        let order = variant.order_override().unwrap_or(self.reader.byte_order());
        for field in variant.fields() {
            if !field.range().contains(self.version) {
                continue;
            }
            let position = origin + field.offset();
            self.reader.seek(position)?;
            field
                .read(&mut target, self, field.byte_order().unwrap_or(order))
                .with_context(|| format!("reading {} field at {position:#x}", type_name::<T>()))?;
        }
        if let Some(size) = variant.fixed_size() {
            self.reader.seek(origin + size)?;
        }
        Ok(target)
    }

    pub fn read_object_at<T: Layout>(&mut self, position: u64) -> Result<T> {
        self.reader.seek(position)?;
        self.read_object()
    }

    /// Reads `count` consecutive objects; `T` must declare a fixed size.
    pub fn read_array<T: Layout>(&mut self, count: usize) -> Result<Vec<T>> {
        if count == 0 {
            return Ok(vec![]);
        }
        let size = definition::<T>()?
            .select(self.version)?
            .fixed_size()
            .ok_or(Error::MissingSize(type_name::<T>()))?;
        let start = self.reader.position()?;
        let mut items = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for i in 0..count as u64 {
            items.push(self.read_object_at(start + i * size)?);
        }
        Ok(items)
    }
}

/// An endian reader paired with the dependencies used to construct objects.
pub struct DependencyReader<R> {
    reader: EndianReader<R>,
    deps: Dependencies,
}

impl<R: ReadSeek> DependencyReader<R> {
    pub fn new(inner: R, order: ByteOrder) -> Self {
        Self::from_reader(EndianReader::new(inner, order), Dependencies::new())
    }
    pub fn from_reader(reader: EndianReader<R>, deps: Dependencies) -> Self {
        Self { reader, deps }
    }
    pub fn register<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> &mut Self {
        self.deps.register(value);
        self
    }
    pub fn dependencies(&self) -> &Dependencies {
        &self.deps
    }
    pub fn reader(&mut self) -> &mut EndianReader<R> {
        &mut self.reader
    }
    pub fn byte_order(&self) -> ByteOrder {
        self.reader.byte_order()
    }
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.reader.position()?)
    }
    pub fn seek(&mut self, position: u64) -> Result<()> {
        self.reader.seek(position)?;
        Ok(())
    }
    pub fn read<T: Primitive>(&mut self) -> Result<T> {
        Ok(self.reader.read()?)
    }
    pub fn read_array_of<T: Primitive>(&mut self, count: usize) -> Result<Vec<T>> {
        Ok(self.reader.read_array(count)?)
    }

    pub fn context(&mut self, version: Option<i32>) -> ReadContext<'_, '_> {
        ReadContext::new(self.reader.by_ref_dyn(), version, &self.deps)
    }
    pub fn read_object<T: Layout>(&mut self, version: Option<i32>) -> Result<T> {
        self.context(version).read_object()
    }
    pub fn read_object_at<T: Layout>(&mut self, position: u64, version: Option<i32>) -> Result<T> {
        self.context(version).read_object_at(position)
    }
    pub fn read_array<T: Layout>(&mut self, count: usize, version: Option<i32>) -> Result<Vec<T>> {
        self.context(version).read_array(count)
    }

    /// Sub-reader with positions relative to `origin`, sharing this reader's
    /// stream and dependencies.
    pub fn create_virtual_reader(&mut self, origin: u64) -> DependencyReader<&mut R> {
        DependencyReader {
            reader: self.reader.create_virtual_reader(origin),
            deps: self.deps.clone(),
        }
    }
}
