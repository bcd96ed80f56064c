//! Mapping between the pointer domain used inside tag data and file offsets.

/// A pair of pure functions converting between stored pointers and
/// addresses that can be used to seek the underlying file.
pub trait AddressTranslator {
    fn get_address(&self, pointer: i64) -> i64;
    fn get_pointer(&self, address: i64) -> i64;
}

/// A named region of the file with its own base offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: &'static str,
    pub virtual_address: i64,
    pub size: i64,
    pub offset: i64,
}

impl Section {
    fn contains_pointer(&self, pointer: i64) -> bool {
        pointer >= self.virtual_address && pointer < self.virtual_address + self.size
    }
    fn contains_address(&self, address: i64) -> bool {
        self.contains_pointer(address - self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionTable {
    sections: Vec<Section>,
    default_section: usize,
}

impl SectionTable {
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }
    fn default_offset(&self) -> i64 {
        self.sections
            .get(self.default_section)
            .map_or(0, |s| s.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translator {
    /// `address = pointer - magic`
    Magic { magic: i64 },
    /// Region lookup through a section table.
    Section(SectionTable),
}

impl Default for Translator {
    fn default() -> Self {
        Translator::zero()
    }
}

impl Translator {
    pub fn magic(magic: i64) -> Self {
        Translator::Magic { magic }
    }

    /// Identity mapping for regions that store raw file offsets.
    pub fn zero() -> Self {
        Translator::Magic { magic: 0 }
    }

    /// Metadata translator derived from the header's virtual base and tag data address.
    pub fn tag_data(virtual_base_address: i64, tag_data_address: i64) -> Self {
        Translator::magic(virtual_base_address - tag_data_address)
    }

    /// Translator derived from the first tag pointer stored in the index.
    pub fn from_index(first_tag_pointer: i64, index_address: i64, metadata_base: i64) -> Self {
        Translator::magic(first_tag_pointer - (index_address + metadata_base))
    }

    /// Pointers outside every section fall back to `default_section`.
    pub fn sections(sections: Vec<Section>, default_section: usize) -> Self {
        Translator::Section(SectionTable {
            sections,
            default_section,
        })
    }
}

impl AddressTranslator for Translator {
    fn get_address(&self, pointer: i64) -> i64 {
        match self {
            Translator::Magic { magic } => pointer - magic,
            Translator::Section(table) => {
                let offset = table
                    .sections
                    .iter()
                    .find(|s| s.contains_pointer(pointer))
                    .map_or_else(|| table.default_offset(), |s| s.offset);
                pointer + offset
            }
        }
    }

    fn get_pointer(&self, address: i64) -> i64 {
        match self {
            Translator::Magic { magic } => address + magic,
            Translator::Section(table) => {
                let offset = table
                    .sections
                    .iter()
                    .find(|s| s.contains_address(address))
                    .map_or_else(|| table.default_offset(), |s| s.offset);
                address - offset
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_round_trip(translator: &Translator, values: impl IntoIterator<Item = i64>) {
        for x in values {
            assert_eq!(translator.get_address(translator.get_pointer(x)), x, "{translator:?} {x:#x}");
            assert_eq!(translator.get_pointer(translator.get_address(x)), x, "{translator:?} {x:#x}");
        }
    }

    #[test]
    fn test_magic_round_trip() {
        let values = [0, 1, 0x100, 0x3000, 0x7fff_ffff, 0x1_0000_0000];
        assert_round_trip(&Translator::zero(), values);
        assert_round_trip(&Translator::magic(0x1234), values);
        assert_round_trip(&Translator::magic(-0x50000000), values);

        let tag = Translator::tag_data(0x100000, 0x100);
        assert_eq!(tag.get_address(0x100000), 0x100);
        assert_round_trip(&tag, values);

        let index = Translator::from_index(0x40440028, 0x40000, 0x28);
        assert_eq!(index.get_address(0x40440028), 0x40028);
    }

    #[test]
    fn test_section_round_trip() {
        let translator = Translator::sections(
            vec![
                Section { name: "debug", virtual_address: 0, size: 0x1000, offset: 0x3000 },
                Section { name: "resource", virtual_address: 0x1000, size: 0x1000, offset: 0x8000 },
                Section { name: "tags", virtual_address: 0x2000, size: 0x4000, offset: 0x10000 },
            ],
            0,
        );
        assert_eq!(translator.get_address(0x10), 0x3010);
        assert_eq!(translator.get_address(0x1010), 0x9010);
        assert_eq!(translator.get_address(0x2010), 0x12010);

        for p in (0..0x6000).step_by(0x1ff) {
            let address = translator.get_address(p);
            assert_eq!(translator.get_pointer(address), p);
            assert_eq!(translator.get_address(translator.get_pointer(address)), address);
        }

        // unmapped pointers use the default section
        assert_eq!(translator.get_address(0x9000), 0xc000);
    }
}
