//! Field types shared by tag layouts and a few system tag definitions.

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};

use anyhow::{Result, anyhow};

use crate::cache::{CacheFile, StringIndex};
use crate::cache_type::CacheType::{self, *};
use crate::endian::ByteOrder;
use crate::layout::{Block, Definition, FieldValue, Layout, Offset, VersionRange};
use crate::pointer::Pointer;
use crate::reader::ReadContext;

/// A string id with its value, when the string table was available at read time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringId {
    id: i32,
    value: Option<String>,
}

impl StringId {
    pub fn new(id: i32) -> Self {
        Self { id, value: None }
    }
    pub fn id(&self) -> i32 {
        self.id
    }
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
    pub fn resolve(&mut self, strings: &StringIndex) {
        self.value = strings.get(self.id).map(str::to_owned);
    }
}

impl FieldValue for StringId {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let mut string_id = StringId::new(ctx.read::<i32>(order)?);
        if let Some(strings) = ctx.deps().get::<StringIndex>() {
            string_id.resolve(&strings);
        }
        Ok(string_id)
    }
}

impl Display for StringId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => f.write_str(value),
            None => write!(f, "{:#010x}", self.id),
        }
    }
}

/// Four character class code stored as a big endian integer.
pub fn class_code(class_id: i32) -> Option<String> {
    (class_id != -1).then(|| String::from_utf8_lossy(&class_id.to_be_bytes()).into_owned())
}

/// Reference to another tag in the same cache.
///
/// Stored as 16 bytes: the class id at 0 and the tag id at 12.
#[derive(Debug, Clone)]
pub struct TagReference {
    cache: Weak<CacheFile>,
    class_id: i32,
    tag_id: i32,
}

impl Default for TagReference {
    fn default() -> Self {
        Self {
            cache: Weak::new(),
            class_id: -1,
            tag_id: -1,
        }
    }
}

impl TagReference {
    pub fn class_id(&self) -> i32 {
        self.class_id
    }
    pub fn class_code(&self) -> Option<String> {
        class_code(self.class_id)
    }
    pub fn tag_id(&self) -> i32 {
        self.tag_id
    }
    pub fn is_null(&self) -> bool {
        self.tag_id == -1
    }
    /// Index of the referenced item in the tag index.
    pub fn tag_index(&self) -> Option<i32> {
        (!self.is_null()).then_some(self.tag_id & 0xFFFF)
    }
    pub fn cache(&self) -> Option<Arc<CacheFile>> {
        self.cache.upgrade()
    }

    /// Reads the referenced tag's metadata, or `None` for a null reference.
    pub fn read_metadata<T: Layout>(&self) -> Result<Option<Arc<T>>> {
        if self.is_null() {
            return Ok(None);
        }
        let cache = self
            .cache()
            .ok_or_else(|| anyhow!("cache for tag {:#010x} is no longer open", self.tag_id))?;
        let tag = cache
            .tag(self.tag_id)
            .ok_or_else(|| anyhow!("tag {:#010x} is not in the index", self.tag_id))?;
        tag.read_metadata::<T>().map(Some)
    }
}

impl FieldValue for TagReference {
    fn read_field(ctx: &mut ReadContext<'_, '_>, order: ByteOrder) -> Result<Self> {
        let origin = ctx.position()?;
        let class_id = ctx.read::<i32>(order)?;
        ctx.seek(origin + 12)?;
        let tag_id = ctx.read::<i32>(order)?;
        let cache = ctx
            .deps()
            .get::<CacheFile>()
            .map_or_else(Weak::new, |cache| Arc::downgrade(&cache));
        Ok(Self {
            cache,
            class_id,
            tag_id,
        })
    }
}

#[derive(Debug, Default)]
pub struct StructureBspBlock {
    pub bsp_reference: TagReference,
}

impl Layout for StructureBspBlock {
    fn define(def: &mut Definition<Self>) {
        def.version(..Halo3Retail).size(104).field(0, |s| &mut s.bsp_reference);
        def.version(Halo3Retail..).size(108).field(0, |s| &mut s.bsp_reference);
    }
}

#[derive(Debug, Default)]
pub struct SkyReferenceBlock {
    pub sky_reference: TagReference,
}

impl Layout for SkyReferenceBlock {
    fn define(def: &mut Definition<Self>) {
        def.unversioned().size(20).field(0, |s| &mut s.sky_reference);
    }
}

/// `scnr`: the map's root tag.
#[derive(Debug, Default)]
pub struct Scenario {
    pub structure_bsps: Block<StructureBspBlock>,
    pub skies: Block<SkyReferenceBlock>,
    pub lightmap_reference: TagReference,
}

impl Scenario {
    fn variant(def: &mut Definition<Self>, from: CacheType, to: CacheType, offsets: [u64; 3]) {
        let [bsps, skies, lightmap] = offsets;
        def.version(from..to)
            .block(bsps, |s| &mut s.structure_bsps)
            .block(skies, |s| &mut s.skies)
            .field(lightmap, |s| &mut s.lightmap_reference);
    }
}

impl Layout for Scenario {
    fn define(def: &mut Definition<Self>) {
        // alpha maps carry a scenario tag but nothing in it is mapped
        def.version(VersionRange::exact(Halo3Alpha));
        def.version(Halo3Delta..Halo3Retail)
            .block(12, |s| &mut s.structure_bsps)
            .block(40, |s| &mut s.skies)
            .field(Offset::at(1736).exact(Halo3Delta), |s| &mut s.lightmap_reference)
            .field(Offset::at(1720).exact(Halo3Beta), |s| &mut s.lightmap_reference);

        Self::variant(def, Halo3Retail, MccHalo3F6, [20, 48, 1776]);
        Self::variant(def, MccHalo3F6, MccHalo3U12, [20, 48, 1764]);
        Self::variant(def, MccHalo3U12, MccHalo3U13, [24, 52, 1700]);
        Self::variant(def, MccHalo3U13, Halo3ODST, [24, 52, 1708]);

        Self::variant(def, Halo3ODST, MccHalo3ODSTF3, [20, 76, 1852]);
        Self::variant(def, MccHalo3ODSTF3, MccHalo3ODSTU7, [20, 76, 1840]);
        Self::variant(def, MccHalo3ODSTU7, MccHalo3ODSTU8, [24, 80, 1776]);
        Self::variant(def, MccHalo3ODSTU8, HaloReachBeta, [24, 80, 1772]);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResourceFixupBlock {
    pub unknown: i32,
    pub offset: i32,
}

impl ResourceFixupBlock {
    /// Offset with the four type bits removed.
    pub fn target_offset(&self) -> i32 {
        self.offset & 0x0FFF_FFFF
    }
}

impl Layout for ResourceFixupBlock {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(8)
            .field(0, |s| &mut s.unknown)
            .field(4, |s| &mut s.offset);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResourceDefinitionFixupBlock {
    pub offset: i32,
    pub unknown: i32,
}

impl Layout for ResourceDefinitionFixupBlock {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(8)
            .field(0, |s| &mut s.offset)
            .field(4, |s| &mut s.unknown);
    }
}

#[derive(Debug, Default)]
pub struct ResourceEntryBlock {
    pub owner_reference: TagReference,
    pub resource_identifier: i32,
    pub fixup_offset: i32,
    pub fixup_size: i32,
    pub location_type: i16,
    pub segment_index: i16,
    pub resource_fixups: Block<ResourceFixupBlock>,
    pub definition_fixups: Block<ResourceDefinitionFixupBlock>,
}

impl Layout for ResourceEntryBlock {
    fn define(def: &mut Definition<Self>) {
        def.version(..Halo3Retail)
            .size(96)
            .field(0, |s| &mut s.owner_reference)
            .field(16, |s| &mut s.resource_identifier)
            .field(24, |s| &mut s.fixup_offset)
            .field(28, |s| &mut s.fixup_size)
            .block(72, |s| &mut s.resource_fixups)
            .block(84, |s| &mut s.definition_fixups);

        def.version(Halo3Retail..)
            .size(64)
            .field(0, |s| &mut s.owner_reference)
            .field(16, |s| &mut s.resource_identifier)
            .field(20, |s| &mut s.fixup_offset)
            .field(24, |s| &mut s.fixup_size)
            .field(32, |s| &mut s.location_type)
            .field(34, |s| &mut s.segment_index)
            .block(40, |s| &mut s.resource_fixups)
            .block(52, |s| &mut s.definition_fixups);
    }
}

/// `zone`: resource entries for every tag in the map.
#[derive(Debug, Default)]
pub struct ResourceGestalt {
    pub resource_entries: Block<ResourceEntryBlock>,
    pub fixup_data_size: i32,
    pub fixup_data_pointer: Pointer,
}

impl Layout for ResourceGestalt {
    fn define(def: &mut Definition<Self>) {
        let v = def.unversioned();
        // console builds and MCC builds alternate between two offset sets
        for (offsets, from, to) in [
            ([36, 132, 144], None, Some(Halo3Retail)),
            ([88, 316, 328], Some(Halo3Retail), Some(MccHalo3)),
            ([100, 328, 340], Some(MccHalo3), Some(Halo3ODST)),
            ([88, 316, 328], Some(Halo3ODST), Some(MccHalo3ODST)),
            ([100, 328, 340], Some(MccHalo3ODST), None),
        ] {
            let at = |offset: u64| {
                let mut at = Offset::at(offset);
                if let Some(from) = from {
                    at = at.min(from);
                }
                if let Some(to) = to {
                    at = at.max(to);
                }
                at
            };
            v.block(at(offsets[0]), |s| &mut s.resource_entries)
                .field(at(offsets[1]), |s| &mut s.fixup_data_size)
                .field(at(offsets[2]), |s| &mut s.fixup_data_pointer);
        }
    }
}

#[derive(Debug, Default)]
pub struct SharedCacheBlock {
    pub file_name: String,
}

impl Layout for SharedCacheBlock {
    fn define(def: &mut Definition<Self>) {
        def.unversioned().size(264).fixed_string(0, 256, |s| &mut s.file_name);
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PageBlock {
    pub cache_index: i16,
    pub data_offset: i32,
    pub compressed_size: i32,
    pub decompressed_size: i32,
}

impl PageBlock {
    /// Pages with a cache index of -1 live in the map itself.
    pub fn is_local(&self) -> bool {
        self.cache_index == -1
    }
}

impl Layout for PageBlock {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(88)
            .field(4, |s| &mut s.cache_index)
            .field(8, |s| &mut s.data_offset)
            .field(12, |s| &mut s.compressed_size)
            .field(16, |s| &mut s.decompressed_size);
    }
}

/// `play`: where resource pages live, locally or in shared maps.
#[derive(Debug, Default)]
pub struct ResourceLayoutTable {
    pub shared_caches: Block<SharedCacheBlock>,
    pub pages: Block<PageBlock>,
}

impl Layout for ResourceLayoutTable {
    fn define(def: &mut Definition<Self>) {
        def.version(Halo3Beta..)
            .block(12, |s| &mut s.shared_caches)
            .block(24, |s| &mut s.pages);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::Translator;
    use crate::reader::DependencyReader;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_class_code() {
        assert_eq!(class_code(0x73636e72).as_deref(), Some("scnr"));
        assert_eq!(class_code(-1), None);
    }

    #[test]
    fn test_tag_reference() -> Result<()> {
        let mut data = vec![];
        data.extend(0x62697462i32.to_be_bytes());
        data.extend([0; 8]);
        data.extend(0x0003_0002i32.to_be_bytes());
        let mut reader = DependencyReader::new(Cursor::new(data), ByteOrder::BigEndian);
        let mut ctx = reader.context(None);
        let reference = TagReference::read_field(&mut ctx, ByteOrder::BigEndian)?;
        assert_eq!(reference.class_code().as_deref(), Some("bitb"));
        assert_eq!(reference.tag_index(), Some(2));
        assert!(reference.cache().is_none());
        assert!(TagReference::default().read_metadata::<Scenario>()?.is_none());
        Ok(())
    }

    #[test]
    fn test_scenario_versions() -> Result<()> {
        // skies block at 48 for retail and at 76 for ODST, both one element at 0x200
        let mut data = vec![0u8; 0x800];
        for at in [48usize, 76] {
            data[at..at + 4].copy_from_slice(&1i32.to_be_bytes());
            data[at + 4..at + 8].copy_from_slice(&0x200i32.to_be_bytes());
        }
        data[0x20c..0x210].copy_from_slice(&0x00010005i32.to_be_bytes());

        let mut reader = DependencyReader::new(Cursor::new(data), ByteOrder::BigEndian);
        reader.register(Arc::new(Translator::zero()));
        for version in [Halo3Retail, Halo3ODST] {
            let scenario: Scenario = reader.read_object_at(0, Some(version.into()))?;
            assert_eq!(scenario.skies.len(), 1);
            assert_eq!(scenario.skies[0].sky_reference.tag_index(), Some(5));
            assert!(scenario.structure_bsps.is_empty());
        }
        Ok(())
    }

    #[test]
    fn test_resource_gestalt_offsets() -> Result<()> {
        let mut data = vec![0u8; 0x200];
        data[316..320].copy_from_slice(&0x40i32.to_le_bytes());
        data[328..332].copy_from_slice(&0x80i32.to_le_bytes());
        data[340..344].copy_from_slice(&0x1234i32.to_le_bytes());

        let mut reader = DependencyReader::new(Cursor::new(data), ByteOrder::LittleEndian);
        reader.register(Arc::new(Translator::zero()));
        let retail: ResourceGestalt = reader.read_object_at(0, Some(Halo3Retail.into()))?;
        assert_eq!((retail.fixup_data_size, retail.fixup_data_pointer.value()), (0x40, 0x80));
        let mcc: ResourceGestalt = reader.read_object_at(0, Some(MccHalo3U6.into()))?;
        assert_eq!((mcc.fixup_data_size, mcc.fixup_data_pointer.value()), (0x80, 0x1234));
        assert!(mcc.resource_entries.is_empty());
        Ok(())
    }
}
