//! Readers for Blam engine cache files and Gen5 module archives.
//!
//! [`CacheFile::open`] detects the build from the file header, loads the tag
//! index and string table, and hands out [`Tag`] views whose metadata is read
//! through [`Layout`] definitions. [`Module::open`] does the same for module
//! archives, whose item data is block compressed.

pub mod address;
pub mod cache;
pub mod cache_type;
pub mod chunk_stream;
pub mod compression;
pub mod detect;
pub mod endian;
pub mod error;
pub mod file_pool;
pub mod layout;
pub mod module;
pub mod pointer;
pub mod reader;
pub mod string_id;
pub mod tags;

pub use address::{AddressTranslator, Section, Translator};
pub use cache::{CacheFile, CacheHeader, Config, FormatProfile, LoadState, StringIndex, Tag, TagIndex};
pub use cache_type::{CacheMetadata, CacheType, HaloGame};
pub use chunk_stream::ChunkStream;
pub use detect::CacheArgs;
pub use endian::ByteOrder;
pub use error::{Error, ErrorKind};
pub use layout::{Block, Definition, FieldValue, IntoOffset, Layout, Offset, VersionRange};
pub use module::{Module, ModuleTag, ModuleType};
pub use pointer::{Pointer, Pointer64, PointerExpander};
pub use reader::{Dependencies, DependencyReader, ReadContext};
pub use string_id::StringIdTranslator;
pub use tags::{StringId, TagReference};
