//! Gen5 module archives: an item table, a name blob and block-compressed item data.

use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::io::{BufReader, Cursor, Seek, SeekFrom};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use bitflags::bitflags;
use indexmap::IndexMap;
use serde::Serialize;
use strum::{AsRefStr, FromRepr};
use tracing::{debug, instrument, trace};

use crate::compression::{self, CompressionMethod};
use crate::endian::{ByteOrder, PREALLOC_LIMIT, ReadSeek, read_exact_vec};
use crate::error::Error;
use crate::file_pool::FilePool;
use crate::layout::{Definition, FieldValue, Layout, Offset, VersionBuilder, definition};
use crate::reader::{DataScope, DependencyReader, ReadContext};
use crate::tags::class_code;

/// `mohd` read little endian.
pub const MODULE_MAGIC: i32 = 0x64686f6d;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromRepr, AsRefStr, Serialize)]
#[repr(i32)]
pub enum ModuleType {
    Halo5Server = 23,
    Halo5Forge = 27,
    HaloInfinite = 53,
}

impl From<ModuleType> for i32 {
    fn from(value: ModuleType) -> i32 {
        value as i32
    }
}

impl ModuleType {
    pub fn compression(self) -> CompressionMethod {
        match self {
            ModuleType::HaloInfinite => CompressionMethod::Oodle,
            ModuleType::Halo5Server | ModuleType::Halo5Forge => CompressionMethod::Zlib,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileEntryFlags: u8 {
        const COMPRESSED = 1;
        const HAS_BLOCKS = 2;
        const RAW_FILE = 4;
    }
}

fn offset_of(what: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidValue { what, value }.into())
}

fn count_of(what: &'static str, value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        Error::InvalidValue {
            what,
            value: value as i64,
        }
        .into()
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleHeader {
    pub head: i32,
    pub version: i32,
    pub module_id: i64,
    pub item_count: i32,
    pub manifest_count: i32,
    pub resource_index: i32,
    pub strings_size: i32,
    pub resource_count: i32,
    pub block_count: i32,
}

impl ModuleHeader {
    fn fields(v: &mut VersionBuilder<Self>) {
        v.field(0, |h| &mut h.head)
            .field(4, |h| &mut h.version)
            .field(8, |h| &mut h.module_id)
            .field(16, |h| &mut h.item_count)
            .field(20, |h| &mut h.manifest_count)
            .field(24, |h| &mut h.resource_index)
            .field(28, |h| &mut h.strings_size)
            .field(32, |h| &mut h.resource_count)
            .field(36, |h| &mut h.block_count);
    }
}

impl Layout for ModuleHeader {
    fn define(def: &mut Definition<Self>) {
        Self::fields(def.version(..ModuleType::Halo5Forge).size(48));
        Self::fields(def.version(ModuleType::Halo5Forge..).size(56));
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleItem {
    pub name_offset: i32,
    pub parent_index: i32,
    pub resource_count: i32,
    pub resource_index: i32,
    pub block_count: i32,
    pub block_index: i32,
    pub data_offset: i64,
    pub total_compressed_size: u32,
    pub total_uncompressed_size: u32,
    #[serde(skip)]
    pub flags: FileEntryFlags,
    pub global_tag_id: i32,
    pub asset_id: i64,
    pub asset_checksum: i64,
    pub class_id: i32,
    pub uncompressed_header_size: u32,
    pub uncompressed_tag_data_size: u32,
    pub uncompressed_resource_data_size: u32,
    pub header_block_count: i16,
    pub tag_data_block_count: i16,
    pub resource_block_count: i16,
    /// Resolved from the module's name blob.
    pub name: String,
}

impl Layout for ModuleItem {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(88)
            .field(0, |i| &mut i.name_offset)
            .field(4, |i| &mut i.parent_index)
            .field(8, |i| &mut i.resource_count)
            .field(12, |i| &mut i.resource_index)
            .field(16, |i| &mut i.block_count)
            .field(20, |i| &mut i.block_index)
            .field(24, |i| &mut i.data_offset)
            .field(32, |i| &mut i.total_compressed_size)
            .field(36, |i| &mut i.total_uncompressed_size)
            .with(43, |i, ctx, order| {
                i.flags = FileEntryFlags::from_bits_retain(ctx.read::<u8>(order)?);
                Ok(())
            })
            .field(44, |i| &mut i.global_tag_id)
            .field(48, |i| &mut i.asset_id)
            .field(56, |i| &mut i.asset_checksum)
            .field(Offset::at(64).order(ByteOrder::BigEndian), |i| &mut i.class_id)
            .field(68, |i| &mut i.uncompressed_header_size)
            .field(72, |i| &mut i.uncompressed_tag_data_size)
            .field(76, |i| &mut i.uncompressed_resource_data_size)
            .field(80, |i| &mut i.header_block_count)
            .field(82, |i| &mut i.tag_data_block_count)
            .field(84, |i| &mut i.resource_block_count);
    }
}

impl ModuleItem {
    pub fn class_code(&self) -> Option<String> {
        class_code(self.class_id)
    }

    /// Name without the class extension. Resource items keep their full name.
    pub fn full_path(&self) -> &str {
        if self.global_tag_id == -1 {
            return &self.name;
        }
        self.name.rsplit_once('.').map_or(self.name.as_str(), |(path, _)| path)
    }

    pub fn class_name(&self) -> Option<&str> {
        if self.global_tag_id == -1 {
            return None;
        }
        Some(self.name.rsplit_once('.').map_or(self.name.as_str(), |(_, class)| class))
    }

    fn implied_block(&self) -> ModuleBlock {
        ModuleBlock {
            checksum: 0,
            compressed_offset: 0,
            compressed_size: self.total_compressed_size,
            uncompressed_offset: 0,
            uncompressed_size: self.total_uncompressed_size,
            compressed: (self.total_uncompressed_size > self.total_compressed_size) as i32,
        }
    }

    fn data_blocks(&self, module: &Module) -> Result<Vec<ModuleBlock>> {
        if self.block_count == 0 {
            return Ok(vec![self.implied_block()]);
        }
        let start = count_of("block index", self.block_index)?;
        let end = start + count_of("block count", self.block_count)?;
        module
            .blocks
            .get(start..end)
            .map(<[ModuleBlock]>::to_vec)
            .ok_or_else(|| {
                Error::InvalidValue {
                    what: "block range end",
                    value: end as i64,
                }
                .into()
            })
    }

    /// Reads and decompresses the item's data from `module`.
    #[instrument(skip_all, name = "read item data")]
    pub fn read_data(&self, module: &Module) -> Result<Vec<u8>> {
        let blocks = self.data_blocks(module)?;
        let base = module.data_address + offset_of("item data offset", self.data_offset)?;
        let codec = module.module_type.compression();

        let mut file = BufReader::new(module.pool.acquire()?);
        let mut output = Vec::with_capacity(PREALLOC_LIMIT);
        for block in &blocks {
            file.seek(SeekFrom::Start(base + block.compressed_offset as u64))?;
            if block.is_compressed() {
                trace!(
                    "decompressing {} -> {} bytes with {}",
                    block.compressed_size,
                    block.uncompressed_size,
                    codec.as_ref()
                );
                let input = read_exact_vec(&mut file, block.compressed_size as usize)?;
                output.extend(compression::decompress(codec, &input, block.uncompressed_size as usize)?);
            } else {
                output.extend(read_exact_vec(&mut file, block.uncompressed_size as usize)?);
            }
        }
        Ok(output)
    }

    pub fn read_metadata_header(&self, module: &Module) -> Result<MetadataHeader> {
        let data = self.read_data(module)?;
        let mut reader = DependencyReader::new(Cursor::new(data), ByteOrder::LittleEndian);
        MetadataHeader::read(&mut reader, Some(module.module_type.into()))
    }

    /// Reads the item's main structure as `T`.
    pub fn read_metadata<T: Layout>(&self, module: &Module) -> Result<T> {
        let version = Some(module.module_type.into());
        let data = self
            .read_data(module)
            .with_context(|| format!("reading data of {}", self.name))?;
        let mut reader = DependencyReader::new(Cursor::new(data), ByteOrder::LittleEndian);
        let metadata = Arc::new(MetadataHeader::read(&mut reader, version)?);
        reader.register(metadata.clone());

        let main = metadata
            .main_block()
            .ok_or_else(|| anyhow!("{} has no main structure", self.name))?;
        let block = metadata.data_block(main)?;
        let start = offset_of("data block offset", block.offset)?;

        let mut data = reader.create_virtual_reader(metadata.header.header_size as u64);
        let mut ctx = data.context(version);
        ctx.set_scope(Some(DataScope { block: main, start }));
        ctx.read_object_at(start)
            .with_context(|| format!("reading metadata of {}", self.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleBlock {
    pub checksum: i64,
    pub compressed_offset: u32,
    pub compressed_size: u32,
    pub uncompressed_offset: u32,
    pub uncompressed_size: u32,
    pub compressed: i32,
}

impl ModuleBlock {
    pub fn is_compressed(&self) -> bool {
        self.compressed != 0
    }

    fn fields(v: &mut VersionBuilder<Self>, base: u64) {
        v.field(base, |b| &mut b.compressed_offset)
            .field(base + 4, |b| &mut b.compressed_size)
            .field(base + 8, |b| &mut b.uncompressed_offset)
            .field(base + 12, |b| &mut b.uncompressed_size)
            .field(base + 16, |b| &mut b.compressed);
    }
}

impl Layout for ModuleBlock {
    fn define(def: &mut Definition<Self>) {
        Self::fields(def.version(..ModuleType::Halo5Forge).size(20), 0);
        Self::fields(
            def.version(ModuleType::Halo5Forge..)
                .size(32)
                .field(0, |b| &mut b.checksum),
            8,
        );
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TagHeader {
    pub header: i32,
    pub version: i32,
    pub checksum: i64,
    pub dependency_count: i32,
    pub data_block_count: i32,
    pub tag_structure_count: i32,
    pub data_reference_count: i32,
    pub tag_reference_count: i32,
    pub string_id_count: i32,
    pub string_table_size: i32,
    pub zoneset_count: i32,
    pub header_size: u32,
    pub data_size: u32,
    pub resource_data_size: u32,
}

impl Layout for TagHeader {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(80)
            .field(0, |h| &mut h.header)
            .field(4, |h| &mut h.version)
            .field(16, |h| &mut h.checksum)
            .field(28, |h| &mut h.dependency_count)
            .field(32, |h| &mut h.data_block_count)
            .field(36, |h| &mut h.tag_structure_count)
            .field(40, |h| &mut h.data_reference_count)
            .field(44, |h| &mut h.tag_reference_count)
            .field(48, |h| &mut h.string_id_count)
            .field(52, |h| &mut h.string_table_size)
            .field(56, |h| &mut h.zoneset_count)
            .field(60, |h| &mut h.header_size)
            .field(64, |h| &mut h.data_size)
            .field(68, |h| &mut h.resource_data_size);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TagDependency {
    pub class_id: i32,
    pub name_offset: i32,
    pub asset_id: i64,
    pub global_id: i32,
}

impl Layout for TagDependency {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(24)
            .field(Offset::at(0).order(ByteOrder::BigEndian), |d| &mut d.class_id)
            .field(4, |d| &mut d.name_offset)
            .field(8, |d| &mut d.asset_id)
            .field(16, |d| &mut d.global_id);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataBlock {
    pub size: u32,
    pub section: i16,
    pub offset: i64,
}

impl Layout for DataBlock {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(16)
            .field(0, |b| &mut b.size)
            .field(6, |b| &mut b.section)
            .field(8, |b| &mut b.offset);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, AsRefStr)]
#[repr(i16)]
pub enum StructureType {
    Main = 0,
    TagBlock = 1,
    Resource = 2,
    Custom = 3,
    Literal = 4,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TagStructureDefinition {
    pub guid: [u8; 16],
    pub kind: i16,
    pub target_index: i32,
    pub field_block: i32,
    pub field_offset: u32,
}

impl TagStructureDefinition {
    pub fn structure_type(&self) -> Option<StructureType> {
        StructureType::from_repr(self.kind)
    }
}

impl Layout for TagStructureDefinition {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(32)
            .field(0, |s| &mut s.guid)
            .field(16, |s| &mut s.kind)
            .field(20, |s| &mut s.target_index)
            .field(24, |s| &mut s.field_block)
            .field(28, |s| &mut s.field_offset);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataBlockReference {
    pub parent_structure_index: i32,
    pub target_index: i32,
    pub field_block: i32,
    pub field_offset: u32,
}

impl Layout for DataBlockReference {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(20)
            .field(0, |r| &mut r.parent_structure_index)
            .field(8, |r| &mut r.target_index)
            .field(12, |r| &mut r.field_block)
            .field(16, |r| &mut r.field_offset);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TagBlockReference {
    pub field_block: i32,
    pub field_offset: u32,
    pub name_offset: i32,
    pub dependency_index: i32,
}

impl Layout for TagBlockReference {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(16)
            .field(0, |r| &mut r.field_block)
            .field(4, |r| &mut r.field_offset)
            .field(8, |r| &mut r.name_offset)
            .field(12, |r| &mut r.dependency_index);
    }
}

/// Tables at the start of an item's data describing its blocks and links.
#[derive(Debug, Clone, Default)]
pub struct MetadataHeader {
    pub header: TagHeader,
    pub dependencies: Vec<TagDependency>,
    pub data_blocks: Vec<DataBlock>,
    pub structures: Vec<TagStructureDefinition>,
    pub data_references: Vec<DataBlockReference>,
    pub tag_references: Vec<TagBlockReference>,
    pub string_ids: Vec<i32>,
    strings: BTreeMap<i32, String>,
}

impl MetadataHeader {
    pub fn read<R: ReadSeek>(reader: &mut DependencyReader<R>, version: Option<i32>) -> Result<Self> {
        let header: TagHeader = reader.read_object(version).context("reading tag header")?;
        let dependencies = reader.read_array(count_of("dependency count", header.dependency_count)?, version)?;
        let data_blocks = reader.read_array(count_of("data block count", header.data_block_count)?, version)?;
        let structures = reader.read_array(count_of("structure count", header.tag_structure_count)?, version)?;
        let data_references =
            reader.read_array(count_of("data reference count", header.data_reference_count)?, version)?;
        let tag_references = reader.read_array(count_of("tag reference count", header.tag_reference_count)?, version)?;
        let string_ids = reader.read_array_of::<i32>(count_of("string id count", header.string_id_count)?)?;

        let start = reader.position()?;
        let end = start + count_of("string table size", header.string_table_size)? as u64;
        let mut strings = BTreeMap::new();
        while reader.position()? < end {
            let offset = (reader.position()? - start) as i32;
            strings.insert(offset, reader.reader().read_null_terminated_string(None)?);
        }

        Ok(Self {
            header,
            dependencies,
            data_blocks,
            structures,
            data_references,
            tag_references,
            string_ids,
            strings,
        })
    }

    pub fn section_count(&self) -> i32 {
        self.data_blocks.iter().map(|b| b.section as i32).max().map_or(0, |s| s + 1)
    }

    /// Offset of `section` within the item data. Section 0 is the header itself.
    pub fn section_offset(&self, section: i32) -> Result<u64> {
        if section < 0 || section >= self.section_count() {
            return Err(Error::InvalidValue {
                what: "section index",
                value: section as i64,
            }
            .into());
        }
        if section == 0 {
            return Ok(0);
        }
        let previous: u64 = self
            .data_blocks
            .iter()
            .filter(|b| (b.section as i32) < section)
            .map(|b| b.size as u64)
            .sum();
        Ok(self.header.header_size as u64 + previous)
    }

    pub fn string_at(&self, offset: i32) -> Option<&str> {
        self.strings.get(&offset).map(String::as_str)
    }

    pub fn main_block(&self) -> Option<i32> {
        self.structures
            .iter()
            .find(|s| s.structure_type() == Some(StructureType::Main))
            .map(|s| s.target_index)
    }

    pub fn data_block(&self, index: i32) -> Result<&DataBlock> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.data_blocks.get(i))
            .ok_or_else(|| {
                Error::InvalidValue {
                    what: "data block index",
                    value: index as i64,
                }
                .into()
            })
    }

    fn field_location(ctx: &mut ReadContext<'_, '_>) -> Result<Option<(Arc<Self>, DataScope, u64)>> {
        let (Some(metadata), Some(scope)) = (ctx.deps().get::<Self>(), ctx.scope()) else {
            return Ok(None);
        };
        let offset = ctx.position()?.checked_sub(scope.start);
        Ok(offset.map(|offset| (metadata, scope, offset)))
    }
}

/// Array field whose elements live in another data block, found through the
/// structure definition pointing at this field.
pub struct TagBlock<T> {
    items: Vec<T>,
}

impl<T> TagBlock<T> {
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for TagBlock<T> {
    fn default() -> Self {
        Self { items: vec![] }
    }
}

impl<T> Deref for TagBlock<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.items
    }
}

impl<T: Debug> Debug for TagBlock<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.items).finish()
    }
}

impl<T: Layout> FieldValue for TagBlock<T> {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let location = MetadataHeader::field_location(ctx)?;
        let field = ctx.position()?;
        ctx.seek(field + 16)?;
        let count = ctx.read::<u32>(order)?;
        let Some((metadata, scope, offset)) = location.filter(|_| count > 0) else {
            return Ok(Self::default());
        };

        let Some(target) = metadata
            .structures
            .iter()
            .find(|s| s.field_block == scope.block && s.field_offset as u64 == offset && s.target_index != -1)
            .map(|s| s.target_index)
        else {
            return Ok(Self::default());
        };
        let start = offset_of("data block offset", metadata.data_block(target)?.offset)?;
        let size = definition::<T>()?
            .select(ctx.version())?
            .fixed_size()
            .ok_or(Error::MissingSize(type_name::<T>()))?;

        let previous = ctx.set_scope(Some(DataScope { block: target, start }));
        let items = (0..count as u64)
            .map(|i| ctx.read_object_at(start + i * size))
            .collect::<Result<Vec<T>>>();
        ctx.set_scope(previous);
        Ok(Self { items: items? })
    }
}

/// Reference to another tag by global id, resolved through the item's
/// dependency table when a tag reference entry points at the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleTagReference {
    pub global_id: i32,
    pub class_id: i32,
}

impl Default for ModuleTagReference {
    fn default() -> Self {
        Self {
            global_id: -1,
            class_id: -1,
        }
    }
}

impl ModuleTagReference {
    pub fn is_null(&self) -> bool {
        self.global_id == -1
    }
    pub fn class_code(&self) -> Option<String> {
        class_code(self.class_id)
    }
    pub fn resolve<'a>(&self, module: &'a Module) -> Option<ModuleTag<'a>> {
        module.get_item_by_id(self.global_id)
    }
}

impl FieldValue for ModuleTagReference {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let location = MetadataHeader::field_location(ctx)?;
        let field = ctx.position()?;
        if let Some((metadata, scope, offset)) = location {
            let dependency = metadata
                .tag_references
                .iter()
                .find(|r| r.field_block == scope.block && r.field_offset as u64 == offset)
                .and_then(|r| usize::try_from(r.dependency_index).ok())
                .and_then(|i| metadata.dependencies.get(i));
            if let Some(dependency) = dependency {
                return Ok(Self {
                    global_id: dependency.global_id,
                    class_id: dependency.class_id,
                });
            }
        }

        ctx.seek(field + 8)?;
        let global_id = ctx.read::<i32>(order)?;
        ctx.seek(field + 20)?;
        let class_id = ctx.read::<i32>(ByteOrder::BigEndian)?;
        Ok(Self { global_id, class_id })
    }
}

/// A distinct tag class seen in a module index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleClass {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemRef {
    module: usize,
    item: usize,
}

#[derive(Debug, Default)]
struct ModuleIndex {
    classes: IndexMap<String, ModuleClass>,
    by_id: IndexMap<i32, Vec<ItemRef>>,
    by_class: IndexMap<String, Vec<i32>>,
}

impl ModuleIndex {
    fn import(&mut self, module: usize, items: &[ModuleItem]) {
        for (item, entry) in items.iter().enumerate().filter(|(_, e)| e.global_tag_id != -1) {
            let code = entry.class_code().unwrap_or_default();
            self.classes.entry(code.clone()).or_insert_with(|| ModuleClass {
                code: code.clone(),
                name: entry.class_name().unwrap_or_default().to_owned(),
            });

            let item = ItemRef { module, item };
            match self.by_id.get_mut(&entry.global_tag_id) {
                Some(group) => group.push(item),
                None => {
                    self.by_id.insert(entry.global_tag_id, vec![item]);
                    self.by_class.entry(code).or_default().push(entry.global_tag_id);
                }
            }
        }
    }
}

pub struct Module {
    pool: FilePool,
    header: ModuleHeader,
    module_type: ModuleType,
    items: Vec<ModuleItem>,
    strings: BTreeMap<i32, String>,
    resources: Vec<i32>,
    blocks: Vec<ModuleBlock>,
    data_address: u64,
    index: ModuleIndex,
    linked: Vec<Module>,
}

impl Debug for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path())
            .field("module_type", &self.module_type)
            .field("items", &self.items.len())
            .field("linked", &self.linked.len())
            .finish()
    }
}

impl Module {
    #[instrument(skip_all, name = "open module")]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()).into());
        }
        let pool = FilePool::new(path, 8).with_context(|| format!("opening {}", path.display()))?;
        let mut reader = DependencyReader::new(BufReader::new(pool.acquire()?), ByteOrder::LittleEndian);

        if reader.read::<i32>()? != MODULE_MAGIC {
            return Err(Error::NotAValidArchive.into());
        }
        let version = reader.read::<i32>()?;
        let module_type = ModuleType::from_repr(version)
            .ok_or_else(|| Error::UnsupportedFormat(format!("module version {version}")))?;
        let layout = Some(module_type.into());

        let header: ModuleHeader = reader.read_object_at(0, layout).context("reading module header")?;
        let mut items: Vec<ModuleItem> = reader.read_array(count_of("item count", header.item_count)?, layout)?;

        let origin = reader.position()?;
        let end = origin + count_of("strings size", header.strings_size)? as u64;
        let mut strings = BTreeMap::new();
        while reader.position()? < end {
            let offset = (reader.position()? - origin) as i32;
            strings.insert(offset, reader.reader().read_null_terminated_string(None)?);
        }
        for item in &mut items {
            item.name = strings.get(&item.name_offset).cloned().unwrap_or_default();
        }

        let resources = reader.read_array_of::<i32>(count_of("resource count", header.resource_count)?)?;
        let blocks = reader.read_array(count_of("block count", header.block_count)?, layout)?;
        let data_address = reader.position()?;
        drop(reader);

        let mut index = ModuleIndex::default();
        index.import(0, &items);
        debug!(
            "{} module with {} items and {} blocks, data at {data_address:#x}",
            module_type.as_ref(),
            items.len(),
            blocks.len()
        );

        Ok(Self {
            pool,
            header,
            module_type,
            items,
            strings,
            resources,
            blocks,
            data_address,
            index,
            linked: vec![],
        })
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }
    pub fn header(&self) -> &ModuleHeader {
        &self.header
    }
    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }
    pub fn items(&self) -> &[ModuleItem] {
        &self.items
    }
    pub fn strings(&self) -> &BTreeMap<i32, String> {
        &self.strings
    }
    pub fn resources(&self) -> &[i32] {
        &self.resources
    }
    pub fn blocks(&self) -> &[ModuleBlock] {
        &self.blocks
    }
    pub fn data_address(&self) -> u64 {
        self.data_address
    }

    pub fn item(&self, index: usize) -> Option<ModuleTag<'_>> {
        self.items.get(index).map(|item| ModuleTag { module: self, item })
    }

    /// Merges the items of another module into this module's index.
    /// Returns false if a module with the same path is already present.
    pub fn add_linked_module(&mut self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let same = |other: &Path| {
            other
                .to_string_lossy()
                .eq_ignore_ascii_case(&path.to_string_lossy())
        };
        if same(self.path()) || self.linked.iter().any(|m| same(m.path())) {
            return Ok(false);
        }
        let module = Module::open(path)?;
        self.index.import(self.linked.len() + 1, &module.items);
        self.linked.push(module);
        Ok(true)
    }

    pub fn linked_modules(&self) -> &[Module] {
        &self.linked
    }

    fn resolve(&self, item: ItemRef) -> Option<ModuleTag<'_>> {
        let module = match item.module {
            0 => self,
            n => self.linked.get(n - 1)?,
        };
        module.item(item.item)
    }

    /// First instance of a tag across this module and its linked modules.
    pub fn get_item_by_id(&self, global_id: i32) -> Option<ModuleTag<'_>> {
        self.index
            .by_id
            .get(&global_id)
            .and_then(|group| group.first())
            .and_then(|&item| self.resolve(item))
    }

    /// Every instance of a tag, in the order the modules were linked.
    pub fn find_alternate_tag_instances(&self, global_id: i32) -> impl Iterator<Item = ModuleTag<'_>> {
        self.index
            .by_id
            .get(&global_id)
            .into_iter()
            .flatten()
            .filter_map(|&item| self.resolve(item))
    }

    pub fn get_items_by_class<'a>(&'a self, class_code: &str) -> impl Iterator<Item = ModuleTag<'a>> + use<'a> {
        self.index
            .by_class
            .get(class_code)
            .into_iter()
            .flatten()
            .filter_map(|&id| self.get_item_by_id(id))
    }

    pub fn tag_classes(&self) -> impl Iterator<Item = &ModuleClass> {
        self.index.classes.values()
    }

    /// One instance of each distinct tag.
    pub fn linked_items(&self) -> impl Iterator<Item = ModuleTag<'_>> {
        self.index
            .by_id
            .values()
            .filter_map(|group| group.first())
            .filter_map(|&item| self.resolve(item))
    }
}

/// An item together with the module holding its data.
#[derive(Clone, Copy)]
pub struct ModuleTag<'a> {
    module: &'a Module,
    item: &'a ModuleItem,
}

impl Debug for ModuleTag<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.item.class_code().unwrap_or_default(), self.item.full_path())
    }
}

impl<'a> Deref for ModuleTag<'a> {
    type Target = ModuleItem;
    fn deref(&self) -> &ModuleItem {
        self.item
    }
}

impl<'a> ModuleTag<'a> {
    pub fn module(&self) -> &'a Module {
        self.module
    }
    pub fn item(&self) -> &'a ModuleItem {
        self.item
    }
    pub fn read_data(&self) -> Result<Vec<u8>> {
        self.item.read_data(self.module)
    }
    pub fn read_metadata_header(&self) -> Result<MetadataHeader> {
        self.item.read_metadata_header(self.module)
    }
    pub fn read_metadata<T: Layout>(&self) -> Result<T> {
        self.item.read_metadata(self.module)
    }
}
