//! Gen3 cache files: header, tag index, string table and per-tag metadata.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result, anyhow};
use itertools::Itertools;
use once_cell::sync::OnceCell;
use strum::AsRefStr;
use tracing::{debug, instrument};

use crate::address::{Section, Translator};
use crate::cache_type::CacheType::{self, *};
use crate::cache_type::CacheMetadata;
use crate::detect::CacheArgs;
use crate::endian::{ByteOrder, PREALLOC_LIMIT};
use crate::error::Error;
use crate::file_pool::{FilePool, PooledFileHandle};
use crate::layout::{Definition, Layout, Offset, VersionBuilder};
use crate::pointer::{Pointer, Pointer64, PointerExpander};
use crate::reader::{DependencyReader, ReadContext};
use crate::string_id::StringIdTranslator;
use crate::tags::{ResourceGestalt, ResourceLayoutTable, Scenario, StringId, class_code};

/// Classes whose first instance is cached after it is read.
pub const SYSTEM_CLASSES: [&str; 5] = ["scnr", "matg", "ugh!", "play", "zone"];
const SCENARIO_CLASS: &str = "scnr";

/// Compressed pointer base used by MCC builds.
const MCC_EXPANDER_MAGIC: i64 = 0x5000_0000;

pub type CacheReader = DependencyReader<BufReader<PooledFileHandle>>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Skip build string detection and read the file as this type.
    pub cache_type_override: Option<CacheType>,
    /// Read the system tags in the background once the index is loaded.
    pub prewarm: bool,
    pub file_handles: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_type_override: None,
            prewarm: true,
            file_handles: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, AsRefStr)]
pub enum LoadState {
    Unopened,
    HeaderLoading,
    HeaderLoaded,
    IndexLoading,
    Ready,
}

impl LoadState {
    fn advance(&mut self, next: LoadState) {
        debug_assert!(next > *self, "{self:?} -> {next:?}");
        debug!("load state {} -> {}", self.as_ref(), next.as_ref());
        *self = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum HeaderTranslation {
    /// Header pointers are file offsets.
    Zero,
    /// Header pointers are relative to the header's section table.
    Sections,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum StringIdScheme {
    /// Fixed bit widths for the game with no namespaces.
    Game,
    /// Namespaces described by the header's namespace table.
    NamespaceTable,
}

/// How a family of builds stores pointers and string ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatProfile {
    pub header_translation: HeaderTranslation,
    pub pointer_width: PointerWidth,
    pub expander_magic: Option<i64>,
    pub string_ids: StringIdScheme,
}

impl FormatProfile {
    pub fn for_type(cache_type: CacheType) -> Result<Self> {
        let within = |from: CacheType, to: CacheType| (from..to).contains(&cache_type);
        let profile = |header_translation, pointer_width, expander_magic, string_ids| Self {
            header_translation,
            pointer_width,
            expander_magic,
            string_ids,
        };
        use HeaderTranslation::*;
        use PointerWidth::*;
        use StringIdScheme::*;

        Ok(if within(Halo3Alpha, Halo3Retail) {
            profile(Zero, Bits32, None, Game)
        } else if within(Halo3Retail, MccHalo3) || within(Halo3ODST, MccHalo3ODST) {
            profile(Sections, Bits32, None, Game)
        } else if within(MccHalo3, MccHalo3F6) || within(MccHalo3ODST, MccHalo3ODSTF3) {
            profile(Zero, Bits64, Some(MCC_EXPANDER_MAGIC), Game)
        } else if within(MccHalo3F6, Halo3ODST) || within(MccHalo3ODSTF3, HaloReachBeta) {
            profile(Sections, Bits64, Some(MCC_EXPANDER_MAGIC), NamespaceTable)
        } else {
            return Err(Error::UnsupportedFormat(format!("{} caches", cache_type.as_ref())).into());
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub address: i64,
    pub size: i64,
}

impl Partition {
    fn narrow(v: &mut VersionBuilder<Self>) {
        v.size(8)
            .stored::<u32, _>(0, |p| &mut p.address)
            .stored::<u32, _>(4, |p| &mut p.size);
    }
    fn wide(v: &mut VersionBuilder<Self>) {
        v.size(16).field(0, |p| &mut p.address).field(8, |p| &mut p.size);
    }
}

impl Layout for Partition {
    fn define(def: &mut Definition<Self>) {
        Self::narrow(def.version(Halo3Retail..MccHalo3));
        Self::narrow(def.version(Halo3ODST..MccHalo3ODST));
        Self::wide(def.version(MccHalo3F6..Halo3ODST));
        Self::wide(def.version(MccHalo3ODSTF3..HaloReachBeta));
    }
}

/// Virtual address and size of one of the four file sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionEntry {
    pub virtual_address: i64,
    pub size: i64,
}

impl Layout for SectionEntry {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(8)
            .stored::<u32, _>(0, |s| &mut s.virtual_address)
            .stored::<u32, _>(4, |s| &mut s.size);
    }
}

const SECTION_NAMES: [&str; 4] = ["debug", "resource", "tag", "locale"];
const TAG_SECTION: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct CacheHeader {
    pub file_size: i64,
    pub index_pointer: Pointer64,
    pub tag_data_address: i64,
    pub virtual_size: i64,
    pub build_string: String,
    pub string_count: i32,
    pub string_table_size: i32,
    pub string_table_index_pointer: Pointer,
    pub string_table_pointer: Pointer,
    pub string_namespace_count: i32,
    pub string_namespace_table_pointer: Pointer,
    pub scenario_name: String,
    pub file_count: i32,
    pub file_table_pointer: Pointer,
    pub file_table_size: i32,
    pub file_table_index_pointer: Pointer,
    pub virtual_base_address: i64,
    pub partition_table: Vec<Partition>,
    pub section_offsets: [i32; 4],
    pub section_table: Vec<SectionEntry>,
}

impl CacheHeader {
    /// Console and pre-release layout; pre-release builds sit 8 bytes later
    /// from the string table onwards and have no section tables.
    fn console(v: &mut VersionBuilder<Self>) {
        let pre = |offset: u64| Offset::at(offset).max(Halo3Retail);
        let post = |offset: u64| Offset::at(offset).min(Halo3Retail);
        v.stored::<i32, _>(8, |h| &mut h.file_size)
            .stored::<Pointer, _>(16, |h| &mut h.index_pointer)
            .stored::<i32, _>(20, |h| &mut h.tag_data_address)
            .stored::<i32, _>(24, |h| &mut h.virtual_size)
            .null_terminated(284, Some(32), |h| &mut h.build_string)
            .field(pre(352), |h| &mut h.string_count)
            .field(post(344), |h| &mut h.string_count)
            .field(pre(356), |h| &mut h.string_table_size)
            .field(post(348), |h| &mut h.string_table_size)
            .field(pre(360), |h| &mut h.string_table_index_pointer)
            .field(post(352), |h| &mut h.string_table_index_pointer)
            .field(pre(364), |h| &mut h.string_table_pointer)
            .field(post(356), |h| &mut h.string_table_pointer)
            .null_terminated(pre(440), Some(256), |h| &mut h.scenario_name)
            .null_terminated(post(432), Some(256), |h| &mut h.scenario_name)
            .field(pre(700), |h| &mut h.file_count)
            .field(post(692), |h| &mut h.file_count)
            .field(pre(704), |h| &mut h.file_table_pointer)
            .field(post(696), |h| &mut h.file_table_pointer)
            .field(pre(708), |h| &mut h.file_table_size)
            .field(post(700), |h| &mut h.file_table_size)
            .field(pre(712), |h| &mut h.file_table_index_pointer)
            .field(post(704), |h| &mut h.file_table_index_pointer)
            .stored::<i32, _>(pre(752), |h| &mut h.virtual_base_address)
            .stored::<i32, _>(post(744), |h| &mut h.virtual_base_address)
            .with(post(752), |h, ctx, _| {
                h.partition_table = ctx.read_array(6)?;
                Ok(())
            })
            .field(post(1132), |h| &mut h.section_offsets)
            .with(post(1148), Self::read_section_table);
    }

    fn mcc(v: &mut VersionBuilder<Self>) {
        v.size(12288)
            .stored::<i32, _>(8, |h| &mut h.file_size)
            .field(16, |h| &mut h.index_pointer)
            .stored::<i32, _>(24, |h| &mut h.tag_data_address)
            .null_terminated(288, Some(32), |h| &mut h.build_string)
            .field(348, |h| &mut h.string_count)
            .field(352, |h| &mut h.string_table_size)
            .field(356, |h| &mut h.string_table_index_pointer)
            .field(360, |h| &mut h.string_table_pointer)
            .null_terminated(444, Some(256), |h| &mut h.scenario_name)
            .field(704, |h| &mut h.file_count)
            .field(708, |h| &mut h.file_table_pointer)
            .field(712, |h| &mut h.file_table_size)
            .field(716, |h| &mut h.file_table_index_pointer)
            .field(760, |h| &mut h.virtual_base_address);
    }

    /// Updated MCC layout. Builds before `moved_in` keep the section tables 32 bytes earlier.
    fn mcc_sections(v: &mut VersionBuilder<Self>, moved_in: CacheType) {
        let early = |offset: u64| Offset::at(offset).max(moved_in);
        let late = |offset: u64| Offset::at(offset).min(moved_in);
        v.size(16384)
            .field(8, |h| &mut h.file_size)
            .stored::<i32, _>(16, |h| &mut h.tag_data_address)
            .stored::<i32, _>(20, |h| &mut h.virtual_size)
            .field(32, |h| &mut h.file_count)
            .field(36, |h| &mut h.file_table_pointer)
            .field(40, |h| &mut h.file_table_size)
            .field(44, |h| &mut h.file_table_index_pointer)
            .field(48, |h| &mut h.string_count)
            .field(52, |h| &mut h.string_table_pointer)
            .field(56, |h| &mut h.string_table_size)
            .field(60, |h| &mut h.string_table_index_pointer)
            .field(64, |h| &mut h.string_namespace_count)
            .field(68, |h| &mut h.string_namespace_table_pointer)
            .null_terminated(160, Some(32), |h| &mut h.build_string)
            .null_terminated(224, Some(256), |h| &mut h.scenario_name)
            .field(736, |h| &mut h.virtual_base_address)
            .field(744, |h| &mut h.index_pointer)
            .with(768, |h, ctx, _| {
                h.partition_table = ctx.read_array(6)?;
                Ok(())
            })
            .field(early(1196), |h| &mut h.section_offsets)
            .field(late(1228), |h| &mut h.section_offsets)
            .with(early(1212), Self::read_section_table)
            .with(late(1244), Self::read_section_table);
    }

    fn read_section_table(&mut self, ctx: &mut ReadContext<'_, '_>, _: ByteOrder) -> Result<()> {
        self.section_table = ctx.read_array(4)?;
        Ok(())
    }

    /// Translator for pointers stored in the header, through the section table.
    pub fn section_translator(&self) -> Translator {
        let sections = self
            .section_table
            .iter()
            .zip(self.section_offsets)
            .zip(SECTION_NAMES)
            .map(|((entry, offset), name)| Section {
                name,
                virtual_address: entry.virtual_address,
                size: entry.size,
                offset: offset as i64,
            })
            .collect();
        Translator::sections(sections, 0)
    }

    /// File offset of the start of tag data.
    pub fn tag_data_origin(&self) -> i64 {
        match self.section_table.get(TAG_SECTION) {
            Some(tags) if tags.size > 0 => tags.virtual_address + self.section_offsets[TAG_SECTION] as i64,
            _ => self.tag_data_address,
        }
    }

    fn rebind(&mut self, translator: &Arc<Translator>) {
        for pointer in [
            &mut self.string_table_index_pointer,
            &mut self.string_table_pointer,
            &mut self.string_namespace_table_pointer,
            &mut self.file_table_pointer,
            &mut self.file_table_index_pointer,
        ] {
            *pointer = pointer.rebind(translator.clone());
        }
    }
}

impl Layout for CacheHeader {
    fn define(def: &mut Definition<Self>) {
        Self::console(def.version(Halo3Alpha..Halo3Retail).size(2048));
        Self::console(def.version(Halo3Retail..MccHalo3).size(12288));
        Self::console(def.version(Halo3ODST..MccHalo3ODST).size(12288));
        Self::mcc(def.version(MccHalo3..MccHalo3F6));
        Self::mcc(def.version(MccHalo3ODST..MccHalo3ODSTF3));
        Self::mcc_sections(def.version(MccHalo3F6..Halo3ODST), MccHalo3U6);
        Self::mcc_sections(def.version(MccHalo3ODSTF3..HaloReachBeta), MccHalo3ODSTU3);
    }
}

#[derive(Debug, Clone, Default)]
pub struct TagIndexHeader {
    pub class_count: i32,
    pub class_pointer: Pointer64,
    pub tag_count: i32,
    pub tag_pointer: Pointer64,
}

impl TagIndexHeader {
    fn narrow(v: &mut VersionBuilder<Self>) {
        v.size(32)
            .field(0, |h| &mut h.class_count)
            .stored::<Pointer, _>(4, |h| &mut h.class_pointer)
            .field(8, |h| &mut h.tag_count)
            .stored::<Pointer, _>(12, |h| &mut h.tag_pointer);
    }
    fn wide(v: &mut VersionBuilder<Self>) {
        v.size(72)
            .field(0, |h| &mut h.class_count)
            .field(8, |h| &mut h.class_pointer)
            .field(16, |h| &mut h.tag_count)
            .field(24, |h| &mut h.tag_pointer);
    }
}

impl Layout for TagIndexHeader {
    fn define(def: &mut Definition<Self>) {
        Self::narrow(def.version(Halo3Alpha..MccHalo3));
        Self::narrow(def.version(Halo3ODST..MccHalo3ODST));
        Self::wide(def.version(MccHalo3..Halo3ODST));
        Self::wide(def.version(MccHalo3ODST..HaloReachBeta));
    }
}

#[derive(Debug, Clone, Default)]
pub struct TagClass {
    pub class_id: i32,
    pub parent_id: i32,
    pub grandparent_id: i32,
    pub name: StringId,
}

impl TagClass {
    pub fn class_code(&self) -> String {
        class_code(self.class_id).unwrap_or_default()
    }
    pub fn parent_class_codes(&self) -> Vec<String> {
        [self.parent_id, self.grandparent_id]
            .into_iter()
            .filter_map(class_code)
            .collect()
    }
}

impl Layout for TagClass {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(16)
            .field(0, |c| &mut c.class_id)
            .field(4, |c| &mut c.parent_id)
            .field(8, |c| &mut c.grandparent_id)
            .field(12, |c| &mut c.name);
    }
}

#[derive(Default)]
pub struct IndexItem {
    index: i32,
    id: i32,
    class_index: i16,
    salt: u16,
    meta_pointer: Pointer,
    metadata: OnceCell<Arc<dyn Any + Send + Sync>>,
}

impl IndexItem {
    pub fn index(&self) -> i32 {
        self.index
    }
    pub fn id(&self) -> i32 {
        self.id
    }
    pub fn class_index(&self) -> i16 {
        self.class_index
    }
    pub fn salt(&self) -> u16 {
        self.salt
    }
    pub fn meta_pointer(&self) -> &Pointer {
        &self.meta_pointer
    }
}

impl Debug for IndexItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexItem")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("class_index", &self.class_index)
            .field("meta_pointer", &self.meta_pointer)
            .field("cached", &self.metadata.get().is_some())
            .finish()
    }
}

impl Layout for IndexItem {
    fn define(def: &mut Definition<Self>) {
        def.unversioned()
            .size(8)
            .field(0, |i| &mut i.class_index)
            .field(2, |i| &mut i.salt)
            .field(4, |i| &mut i.meta_pointer);
    }
}

fn file_offset(what: &'static str, address: i64) -> Result<u64> {
    u64::try_from(address).map_err(|_| Error::InvalidValue { what, value: address }.into())
}

fn element_count(what: &'static str, count: i32) -> Result<usize> {
    usize::try_from(count).map_err(|_| {
        Error::InvalidValue {
            what,
            value: count as i64,
        }
        .into()
    })
}

#[derive(Debug, Default)]
pub struct TagIndex {
    classes: Vec<TagClass>,
    items: BTreeMap<i32, IndexItem>,
    filenames: HashMap<i32, String>,
    system: HashMap<&'static str, i32>,
}

impl TagIndex {
    fn read(reader: &mut CacheReader, header: &CacheHeader, version: Option<i32>) -> Result<Self> {
        let index_address = file_offset("tag index address", header.index_pointer.address())?;
        let index_header: TagIndexHeader = reader
            .read_object_at(index_address, version)
            .context("reading tag index header")?;

        reader.seek(file_offset("tag class address", index_header.class_pointer.address())?)?;
        let classes = reader.read_array(element_count("tag class count", index_header.class_count)?, version)?;

        let tag_count = element_count("tag count", index_header.tag_count)?;
        reader.seek(file_offset("tag address", index_header.tag_pointer.address())?)?;
        let items: Vec<IndexItem> = reader.read_array(tag_count, version)?;
        let items = items
            .into_iter()
            .zip(0..)
            // every map carries an empty first tag
            .filter(|(item, _)| item.class_index >= 0)
            .map(|(mut item, index)| {
                item.index = index;
                item.id = ((item.salt as i32) << 16) | index;
                (index, item)
            })
            .collect();

        reader.seek(file_offset("file table index address", header.file_table_index_pointer.address())?)?;
        let name_offsets = reader.read_array_of::<i32>(tag_count)?;
        let mut names = reader.create_virtual_reader(file_offset(
            "file table address",
            header.file_table_pointer.address(),
        )?);
        let mut filenames = HashMap::new();
        for (index, offset) in (0..).zip(name_offsets) {
            if offset < 0 {
                continue;
            }
            names.seek(offset as u64)?;
            filenames.insert(index, names.reader().read_null_terminated_string(None)?);
        }

        Ok(Self {
            classes,
            items,
            filenames,
            system: HashMap::new(),
        })
    }

    fn resolve_class_names(&mut self, strings: &StringIndex) {
        for class in &mut self.classes {
            class.name.resolve(strings);
        }
    }

    fn populate_system_classes(&mut self, scenario_name: &str) -> Result<()> {
        for code in SYSTEM_CLASSES.into_iter().filter(|&c| c != SCENARIO_CLASS) {
            let index = self
                .tags_by_class(code)
                .map(|item| item.index)
                .at_most_one()
                .map_err(|_| Error::DuplicateSystemTag(code))?;
            if let Some(index) = index {
                self.system.insert(code, index);
            }
        }

        let scenario = self
            .tags_by_class(SCENARIO_CLASS)
            .filter(|item| self.filename(item) == Some(scenario_name))
            .map(|item| item.index)
            .exactly_one()
            .map_err(|_| Error::AmbiguousScenario)?;
        self.system.insert(SCENARIO_CLASS, scenario);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
    pub fn classes(&self) -> &[TagClass] {
        &self.classes
    }
    /// Looks up a tag by id or by bare index.
    /// Looks up a full tag id. An id whose salt differs from the item's is stale.
    pub fn get(&self, id: i32) -> Option<&IndexItem> {
        self.items.get(&(id & 0xFFFF)).filter(|item| item.id == id)
    }
    pub fn iter(&self) -> impl Iterator<Item = &IndexItem> {
        self.items.values()
    }
    pub fn class_of(&self, item: &IndexItem) -> Option<&TagClass> {
        usize::try_from(item.class_index)
            .ok()
            .and_then(|i| self.classes.get(i))
    }
    pub fn filename(&self, item: &IndexItem) -> Option<&str> {
        self.filenames.get(&item.index).map(String::as_str)
    }
    pub fn global_tag(&self, class_code: &str) -> Option<&IndexItem> {
        self.system.get(class_code).and_then(|&index| self.items.get(&index))
    }
    pub fn tags_by_class<'a>(&'a self, class_code: &'a str) -> impl Iterator<Item = &'a IndexItem> + 'a {
        self.items
            .values()
            .filter(move |item| self.class_of(item).is_some_and(|c| c.class_code() == class_code))
    }
    fn is_system(&self, item: &IndexItem) -> bool {
        self.system.values().any(|&index| index == item.index)
    }
}

#[derive(Debug, Clone)]
pub struct StringIndex {
    strings: Vec<Option<String>>,
    translator: StringIdTranslator,
}

impl StringIndex {
    pub fn new(strings: Vec<Option<String>>, translator: StringIdTranslator) -> Self {
        Self { strings, translator }
    }

    fn read(reader: &mut CacheReader, header: &CacheHeader, translator: StringIdTranslator) -> Result<Self> {
        let count = element_count("string count", header.string_count)?;
        reader.seek(file_offset("string index address", header.string_table_index_pointer.address())?)?;
        let offsets = reader.read_array_of::<i32>(count)?;

        let mut table = reader.create_virtual_reader(file_offset(
            "string table address",
            header.string_table_pointer.address(),
        )?);
        let mut strings = Vec::with_capacity(count.min(PREALLOC_LIMIT));
        for offset in offsets {
            strings.push(if offset < 0 {
                None
            } else {
                table.seek(offset as u64)?;
                Some(table.reader().read_null_terminated_string(None)?)
            });
        }
        Ok(Self::new(strings, translator))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
    pub fn translator(&self) -> &StringIdTranslator {
        &self.translator
    }
    pub fn get(&self, id: i32) -> Option<&str> {
        let index = usize::try_from(self.translator.get_string_index(id)).ok()?;
        self.strings.get(index)?.as_deref()
    }
    pub fn get_string_id(&self, value: &str) -> Option<i32> {
        let index = self.strings.iter().position(|s| s.as_deref() == Some(value))?;
        Some(self.translator.get_string_id(index as i32))
    }
    pub fn iter(&self) -> impl Iterator<Item = Option<&str>> {
        self.strings.iter().map(Option::as_deref)
    }
}

/// The tag whose metadata is being read, available to fields as a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTag {
    pub id: i32,
    pub class_code: Option<String>,
    pub path: Option<String>,
}

pub struct CacheFile {
    self_ref: Weak<CacheFile>,
    pool: FilePool,
    args: CacheArgs,
    metadata: CacheMetadata,
    profile: FormatProfile,
    header: CacheHeader,
    header_translator: Arc<Translator>,
    metadata_translator: Arc<Translator>,
    expander: Option<Arc<PointerExpander>>,
    tag_index: TagIndex,
    string_index: Arc<StringIndex>,
    state: LoadState,
}

impl Debug for CacheFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFile")
            .field("path", &self.pool.path())
            .field("cache_type", &self.metadata.cache_type)
            .field("tags", &self.tag_index.len())
            .field("strings", &self.string_index.len())
            .finish()
    }
}

impl CacheFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open_with(path, &Config::default())
    }

    #[instrument(skip_all, name = "open cache")]
    pub fn open_with(path: impl AsRef<Path>, config: &Config) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let mut state = LoadState::Unopened;

        let args = CacheArgs::from_path(path)?;
        let metadata = match config.cache_type_override {
            Some(cache_type) => CacheMetadata::for_type(cache_type)
                .ok_or_else(|| Error::UnsupportedFormat(format!("no known build of {}", cache_type.as_ref())))?,
            None => args
                .metadata
                .clone()
                .ok_or_else(|| Error::UnknownBuild(args.build_string.clone()))?,
        };
        let profile = FormatProfile::for_type(metadata.cache_type)?;
        let version = Some(metadata.cache_type.into());
        let pool = FilePool::new(path, config.file_handles)
            .with_context(|| format!("opening {}", path.display()))?;

        state.advance(LoadState::HeaderLoading);
        let mut reader = DependencyReader::new(BufReader::new(pool.acquire()?), args.byte_order);
        reader.register(Arc::new(Translator::zero()));
        let mut header: CacheHeader = reader.read_object_at(0, version).context("reading cache header")?;

        let header_translator = Arc::new(match profile.header_translation {
            HeaderTranslation::Zero => Translator::zero(),
            HeaderTranslation::Sections => header.section_translator(),
        });
        header.rebind(&header_translator);
        let metadata_translator = Arc::new(Translator::tag_data(header.virtual_base_address, header.tag_data_origin()));
        header.index_pointer = header.index_pointer.rebind(metadata_translator.clone());
        state.advance(LoadState::HeaderLoaded);

        state.advance(LoadState::IndexLoading);
        let expander = profile.expander_magic.map(|magic| Arc::new(PointerExpander::new(magic)));
        reader.register(metadata_translator.clone());
        if let Some(expander) = &expander {
            reader.register(expander.clone());
        }
        let mut tag_index = TagIndex::read(&mut reader, &header, version).context("reading tag index")?;

        let translator = StringIdTranslator::for_game(metadata.game);
        let translator = match profile.string_ids {
            StringIdScheme::Game => translator,
            StringIdScheme::NamespaceTable => {
                let count = element_count("string namespace count", header.string_namespace_count)?;
                reader.seek(file_offset(
                    "string namespace address",
                    header.string_namespace_table_pointer.address(),
                )?)?;
                translator.from_namespace_table(&reader.read_array_of::<i32>(count)?)
            }
        };
        let string_index = StringIndex::read(&mut reader, &header, translator).context("reading string table")?;
        drop(reader);

        tag_index.resolve_class_names(&string_index);
        tag_index.populate_system_classes(&header.scenario_name)?;
        state.advance(LoadState::Ready);
        debug!(
            "loaded {} tags and {} strings from {}",
            tag_index.len(),
            string_index.len(),
            path.display()
        );

        let cache = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            pool,
            args,
            metadata,
            profile,
            header,
            header_translator,
            metadata_translator,
            expander,
            tag_index,
            string_index: Arc::new(string_index),
            state,
        });

        if config.prewarm {
            let weak = Arc::downgrade(&cache);
            rayon::spawn(move || {
                if let Some(cache) = weak.upgrade() {
                    cache.prewarm();
                }
            });
        }
        Ok(cache)
    }

    fn prewarm(&self) {
        let results = [
            ("play", self.global_tag("play").map(|t| t.read_metadata::<ResourceLayoutTable>().map(drop))),
            ("zone", self.global_tag("zone").map(|t| t.read_metadata::<ResourceGestalt>().map(drop))),
            ("scnr", self.global_tag("scnr").map(|t| t.read_metadata::<Scenario>().map(drop))),
        ];
        for (code, result) in results {
            if let Some(Err(err)) = result {
                debug!("failed to prewarm {code} metadata: {err:#}");
            }
        }
    }

    pub fn path(&self) -> &Path {
        self.pool.path()
    }
    pub fn args(&self) -> &CacheArgs {
        &self.args
    }
    pub fn header(&self) -> &CacheHeader {
        &self.header
    }
    pub fn metadata(&self) -> &CacheMetadata {
        &self.metadata
    }
    pub fn profile(&self) -> &FormatProfile {
        &self.profile
    }
    pub fn cache_type(&self) -> CacheType {
        self.metadata.cache_type
    }
    pub fn byte_order(&self) -> ByteOrder {
        self.args.byte_order
    }
    pub fn build_string(&self) -> &str {
        &self.args.build_string
    }
    pub fn state(&self) -> LoadState {
        self.state
    }
    pub fn tag_index(&self) -> &TagIndex {
        &self.tag_index
    }
    pub fn string_index(&self) -> &StringIndex {
        &self.string_index
    }
    pub fn header_translator(&self) -> &Arc<Translator> {
        &self.header_translator
    }
    pub fn metadata_translator(&self) -> &Arc<Translator> {
        &self.metadata_translator
    }
    pub fn pointer_expander(&self) -> Option<&Arc<PointerExpander>> {
        self.expander.as_ref()
    }

    /// Reader over a pooled handle with this cache's dependencies registered.
    pub fn create_reader(&self, translator: Arc<Translator>) -> Result<CacheReader> {
        let handle = self.pool.acquire()?;
        let mut reader = DependencyReader::new(BufReader::new(handle), self.byte_order());
        // header pointers are never compressed
        if Arc::ptr_eq(&translator, &self.metadata_translator) {
            if let Some(expander) = &self.expander {
                reader.register(expander.clone());
            }
        }
        reader
            .register(translator)
            .register(self.string_index.clone());
        if let Some(cache) = self.self_ref.upgrade() {
            reader.register(cache);
        }
        Ok(reader)
    }

    pub fn tag(&self, id: i32) -> Option<Tag<'_>> {
        self.tag_index.get(id).map(|item| Tag { cache: self, item })
    }
    pub fn tags(&self) -> impl Iterator<Item = Tag<'_>> {
        self.tag_index.iter().map(|item| Tag { cache: self, item })
    }
    pub fn global_tag(&self, class_code: &str) -> Option<Tag<'_>> {
        self.tag_index
            .global_tag(class_code)
            .map(|item| Tag { cache: self, item })
    }
    pub fn tags_by_class<'a>(&'a self, class_code: &'a str) -> impl Iterator<Item = Tag<'a>> + 'a {
        self.tag_index
            .tags_by_class(class_code)
            .map(|item| Tag { cache: self, item })
    }
}

/// An index entry together with the cache it belongs to.
#[derive(Clone, Copy)]
pub struct Tag<'a> {
    cache: &'a CacheFile,
    item: &'a IndexItem,
}

impl Debug for Tag<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.class_code().unwrap_or_default(),
            self.path().unwrap_or("<unnamed>")
        )
    }
}

impl<'a> Tag<'a> {
    pub fn item(&self) -> &'a IndexItem {
        self.item
    }
    pub fn id(&self) -> i32 {
        self.item.id
    }
    pub fn class(&self) -> Option<&'a TagClass> {
        self.cache.tag_index.class_of(self.item)
    }
    pub fn class_code(&self) -> Option<String> {
        self.class().map(TagClass::class_code)
    }
    pub fn class_name(&self) -> Option<&'a str> {
        self.class().and_then(|c| c.name.value())
    }
    pub fn path(&self) -> Option<&'a str> {
        self.cache.tag_index.filename(self.item)
    }
    pub fn file_name(&self) -> Option<&'a str> {
        self.path().and_then(|p| p.rsplit('\\').next())
    }
    pub fn meta_pointer(&self) -> &'a Pointer {
        &self.item.meta_pointer
    }

    /// File offset of the tag's metadata.
    pub fn metadata_address(&self) -> Result<u64> {
        let address = if self.item.meta_pointer.value() == 0 && self.class_code().as_deref() == Some("play") {
            // play data lives inside zone on builds that store no pointer for it
            let zone = self
                .cache
                .tag_index
                .global_tag("zone")
                .ok_or_else(|| anyhow!("play tag has no metadata pointer and the cache has no zone tag"))?;
            zone.meta_pointer.address() + 28
        } else {
            self.item.meta_pointer.address()
        };
        file_offset("metadata address", address)
    }

    /// Reads the tag's metadata as `T`. System tags are read once and shared.
    pub fn read_metadata<T: Layout>(&self) -> Result<Arc<T>> {
        if !self.cache.tag_index.is_system(self.item) {
            return self.read_uncached().map(Arc::new);
        }
        let cached = self.item.metadata.get_or_try_init(|| -> Result<_> {
            let value: Arc<dyn Any + Send + Sync> = Arc::new(self.read_uncached::<T>()?);
            Ok(value)
        })?;
        match cached.clone().downcast::<T>() {
            Ok(value) => Ok(value),
            Err(_) => self.read_uncached().map(Arc::new),
        }
    }

    fn read_uncached<T: Layout>(&self) -> Result<T> {
        let address = self.metadata_address()?;
        let mut reader = self.cache.create_reader(self.cache.metadata_translator.clone())?;
        reader.register(Arc::new(CurrentTag {
            id: self.id(),
            class_code: self.class_code(),
            path: self.path().map(str::to_owned),
        }));
        reader
            .read_object_at(address, Some(self.cache.cache_type().into()))
            .with_context(|| format!("reading metadata of {self:?}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::find;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const VIRTUAL_BASE: i32 = 0x100000;
    const TAG_DATA: i32 = 0x100;

    fn pointer(address: i32) -> i32 {
        address - TAG_DATA + VIRTUAL_BASE
    }

    /// Minimal big endian Halo 3 retail map.
    struct Fixture {
        classes: Vec<&'static [u8; 4]>,
        /// class index, metadata address (0 for no pointer) and name
        tags: Vec<(i16, i32, &'static str)>,
        scenario_name: &'static str,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                classes: vec![b"scnr", b"matg"],
                tags: vec![
                    (0, 0x3300, "levels\\test\\test"),
                    (1, 0x3380, "globals\\globals"),
                    (0, 0x33c0, "levels\\test\\other"),
                ],
                scenario_name: "levels\\test\\test",
            }
        }

        fn bytes(&self) -> Vec<u8> {
            let mut data = vec![0u8; 0x3800];
            let mut put = |at: usize, bytes: &[u8]| data[at..at + bytes.len()].copy_from_slice(bytes);

            put(0, b"head");
            put(4, &11i32.to_be_bytes());
            put(8, &0x3800i32.to_be_bytes());
            put(16, &pointer(0x3100).to_be_bytes());
            put(20, &TAG_DATA.to_be_bytes());
            put(284, b"11855.07.08.20.2317.halo3_ship");
            put(344, &2i32.to_be_bytes());
            put(352, &0x3400i32.to_be_bytes());
            put(356, &0x3500i32.to_be_bytes());
            put(432, self.scenario_name.as_bytes());
            put(692, &(self.tags.len() as i32 + 1).to_be_bytes());
            put(696, &0x3600i32.to_be_bytes());
            put(704, &0x3700i32.to_be_bytes());
            put(744, &VIRTUAL_BASE.to_be_bytes());

            // index header, classes and items with an empty first tag
            put(0x3100, &(self.classes.len() as i32).to_be_bytes());
            put(0x3104, &pointer(0x3140).to_be_bytes());
            put(0x3108, &(self.tags.len() as i32 + 1).to_be_bytes());
            put(0x310c, &pointer(0x3180).to_be_bytes());
            for (i, code) in self.classes.iter().enumerate() {
                let at = 0x3140 + i * 16;
                put(at, &code[..]);
                put(at + 4, &(-1i32).to_be_bytes());
                put(at + 8, &(-1i32).to_be_bytes());
                put(at + 12, &(i as i32).to_be_bytes());
            }
            put(0x3180, &(-1i16).to_be_bytes());
            let mut name_offset = 0;
            put(0x3700, &(-1i32).to_be_bytes());
            for (i, (class_index, address, name)) in self.tags.iter().enumerate() {
                let at = 0x3188 + i * 8;
                put(at, &class_index.to_be_bytes());
                put(at + 2, &(0xe174u16 + i as u16).to_be_bytes());
                let meta = if *address == 0 { 0 } else { pointer(*address) };
                put(at + 4, &meta.to_be_bytes());

                put(0x3704 + i * 4, &(name_offset as i32).to_be_bytes());
                put(0x3600 + name_offset, name.as_bytes());
                name_offset += name.len() + 1;
            }

            // metadata
            put(0x3300, &0xdeadbeefu32.to_be_bytes());
            put(0x3304, &1i32.to_be_bytes());
            put(0x3380, &0x0badf00du32.to_be_bytes());
            put(0x339c, &0x600dcafeu32.to_be_bytes());
            put(0x33c0, &0x12345678u32.to_be_bytes());

            // strings
            put(0x3400, &0i32.to_be_bytes());
            put(0x3404, &9i32.to_be_bytes());
            put(0x3500, b"scenario\0globals\0");
            data
        }

        fn write(&self) -> Result<tempfile::NamedTempFile> {
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(&self.bytes())?;
            Ok(file)
        }
    }

    fn config() -> Config {
        Config {
            prewarm: false,
            ..Config::default()
        }
    }

    #[derive(Debug, Default)]
    struct Sample {
        value: u32,
        name: StringId,
    }
    impl Layout for Sample {
        fn define(def: &mut Definition<Self>) {
            def.unversioned()
                .size(8)
                .field(0, |p| &mut p.value)
                .field(4, |p| &mut p.name);
        }
    }

    #[test]
    fn test_open() -> Result<()> {
        let file = Fixture::new().write()?;
        let cache = CacheFile::open_with(file.path(), &config())?;

        assert_eq!(cache.state(), LoadState::Ready);
        assert_eq!(cache.cache_type(), Halo3Retail);
        assert_eq!(cache.byte_order(), ByteOrder::BigEndian);
        assert_eq!(cache.header().scenario_name, "levels\\test\\test");
        assert_eq!(cache.tag_index().len(), 3);
        assert_eq!(cache.string_index().get(1), Some("globals"));
        assert_eq!(cache.string_index().get_string_id("globals"), Some(1));

        let classes: Vec<_> = cache
            .tag_index()
            .classes()
            .iter()
            .map(|c| (c.class_code(), c.name.value().map(str::to_owned)))
            .collect();
        assert_eq!(
            classes,
            vec![
                ("scnr".to_string(), Some("scenario".to_string())),
                ("matg".to_string(), Some("globals".to_string())),
            ]
        );

        let scenario = cache.global_tag("scnr").unwrap();
        assert_eq!(scenario.id(), (0xe174 << 16) | 1);
        assert_eq!(scenario.path(), Some("levels\\test\\test"));
        assert_eq!(scenario.file_name(), Some("test"));
        assert_eq!(scenario.class_name(), Some("scenario"));
        assert_eq!(scenario.metadata_address()?, 0x3300);

        let sample = scenario.read_metadata::<Sample>()?;
        assert_eq!(sample.value, 0xdeadbeef);
        assert_eq!(sample.name.value(), Some("globals"));

        assert_eq!(cache.tags_by_class("scnr").count(), 2);
        assert!(cache.global_tag("play").is_none());
        assert_eq!(cache.tag(scenario.id()).map(|t| t.id()), Some(scenario.id()));
        assert!(cache.tag(scenario.id() + 0x10000).is_none());
        assert!(cache.tag(scenario.id() & 0xFFFF).is_none());
        Ok(())
    }

    #[test]
    fn test_ambiguous_scenario() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.tags[2].2 = "levels\\test\\test";
        let file = fixture.write()?;
        let err = CacheFile::open_with(file.path(), &config()).unwrap_err();
        assert!(matches!(find(&err), Some(Error::AmbiguousScenario)));

        let mut fixture = Fixture::new();
        fixture.scenario_name = "levels\\test\\missing";
        let file = fixture.write()?;
        let err = CacheFile::open_with(file.path(), &config()).unwrap_err();
        assert!(matches!(find(&err), Some(Error::AmbiguousScenario)));
        Ok(())
    }

    #[test]
    fn test_duplicate_system_tag() -> Result<()> {
        let mut fixture = Fixture::new();
        fixture.tags[2] = (1, 0x33c0, "globals\\other");
        let file = fixture.write()?;
        let err = CacheFile::open_with(file.path(), &config()).unwrap_err();
        assert!(matches!(find(&err), Some(Error::DuplicateSystemTag("matg"))));
        assert_eq!(crate::error::kind(&err), Some(crate::error::ErrorKind::Format));
        Ok(())
    }

    #[test]
    fn test_truncated_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&Fixture::new().bytes()[..0x3080])?;
        let err = CacheFile::open_with(file.path(), &config()).unwrap_err();
        assert_eq!(crate::error::kind(&err), Some(crate::error::ErrorKind::Io));
        Ok(())
    }

    static COUNTED_READS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Default)]
    struct Counted {
        value: u32,
    }
    impl Layout for Counted {
        fn define(def: &mut Definition<Self>) {
            def.unversioned().field(0, |c| &mut c.value);
        }
        fn bind(&mut self, _: &crate::reader::Dependencies) -> Result<()> {
            COUNTED_READS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_system_tag_read_once() -> Result<()> {
        let file = Fixture::new().write()?;
        let cache = CacheFile::open_with(file.path(), &config())?;

        let results: Vec<Arc<Counted>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| cache.global_tag("matg").unwrap().read_metadata::<Counted>()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect::<Result<_>>()
        })?;
        assert_eq!(COUNTED_READS.load(Ordering::SeqCst), 1);
        assert_eq!(results[0].value, 0x0badf00d);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));

        // the second scenario is not a system tag and is read every time
        let other = cache.tags().find(|t| t.path() == Some("levels\\test\\other")).unwrap();
        let a = other.read_metadata::<Counted>()?;
        let b = other.read_metadata::<Counted>()?;
        assert_eq!(COUNTED_READS.load(Ordering::SeqCst), 3);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.value, 0x12345678);

        // cached under another type
        let sample = cache.global_tag("matg").unwrap().read_metadata::<Sample>()?;
        assert_eq!(sample.value, 0x0badf00d);
        Ok(())
    }

    #[test]
    fn test_play_backfill() -> Result<()> {
        let fixture = Fixture {
            classes: vec![b"scnr", b"zone", b"play"],
            tags: vec![
                (0, 0x3300, "levels\\test\\test"),
                (1, 0x3380, "levels\\test\\test"),
                (2, 0, "levels\\test\\test"),
            ],
            scenario_name: "levels\\test\\test",
        };
        let file = fixture.write()?;
        let cache = CacheFile::open_with(file.path(), &config())?;

        let play = cache.global_tag("play").unwrap();
        assert_eq!(play.meta_pointer().value(), 0);
        assert_eq!(play.metadata_address()?, 0x3380 + 28);
        assert_eq!(play.read_metadata::<Sample>()?.value, 0x600dcafe);
        Ok(())
    }

    #[test]
    fn test_profiles() -> Result<()> {
        assert_eq!(
            FormatProfile::for_type(Halo3Retail)?.header_translation,
            HeaderTranslation::Sections
        );
        assert_eq!(FormatProfile::for_type(Halo3Beta)?.header_translation, HeaderTranslation::Zero);
        let mcc = FormatProfile::for_type(MccHalo3ODST)?;
        assert_eq!(mcc.expander_magic, Some(MCC_EXPANDER_MAGIC));
        assert_eq!(mcc.string_ids, StringIdScheme::Game);
        assert_eq!(
            FormatProfile::for_type(MccHalo3U12)?.string_ids,
            StringIdScheme::NamespaceTable
        );
        let err = FormatProfile::for_type(Halo2Xbox).unwrap_err();
        assert!(matches!(find(&err), Some(Error::UnsupportedFormat(_))));
        Ok(())
    }

    #[test]
    fn test_section_translator() {
        let header = CacheHeader {
            tag_data_address: 0x100,
            section_offsets: [0x1000, 0, 0x8000, 0],
            section_table: vec![
                SectionEntry { virtual_address: 0, size: 0x2000 },
                SectionEntry::default(),
                SectionEntry { virtual_address: 0x4000, size: 0x10000 },
                SectionEntry::default(),
            ],
            ..CacheHeader::default()
        };
        use crate::address::AddressTranslator;
        assert_eq!(header.section_translator().get_address(0x10), 0x1010);
        assert_eq!(header.tag_data_origin(), 0xc000);
        assert_eq!(CacheHeader::default().tag_data_origin(), 0);
    }
}
