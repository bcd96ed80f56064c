use std::path::Path;

use bitflags::bitflags;
use serde::Serialize;
use strum::{AsRefStr, FromRepr, IntoStaticStr, VariantArray};
use tracing::debug;

use CacheType::*;

/// Known cache builds. The discriminant order is significant: it is the
/// version number layouts use to select a variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, AsRefStr, IntoStaticStr, FromRepr, VariantArray,
)]
#[repr(i32)]
pub enum CacheType {
    Unknown = -1,
    Halo1Xbox = 0,
    Halo1PC,
    Halo1CE,
    Halo1AE,
    MccHalo1,
    Halo2Beta,
    Halo2Xbox,
    Halo2Vista,
    MccHalo2,
    Halo3Alpha,
    Halo3Delta,
    Halo3Beta,
    Halo3Retail,
    MccHalo3,
    MccHalo3U4,
    MccHalo3F6,
    MccHalo3U6,
    MccHalo3U9,
    MccHalo3U12,
    MccHalo3U13,
    Halo3ODST,
    MccHalo3ODST,
    MccHalo3ODSTF3,
    MccHalo3ODSTU3,
    MccHalo3ODSTU4,
    MccHalo3ODSTU7,
    MccHalo3ODSTU8,
    HaloReachBeta,
    HaloReachRetail,
    MccHaloReach,
    MccHaloReachU3,
    MccHaloReachU8,
    MccHaloReachU10,
    MccHaloReachU13,
    Halo4Beta,
    Halo4Retail,
    MccHalo4,
    MccHalo4U4,
    MccHalo4U6,
    MccHalo2X,
    MccHalo2XU8,
    MccHalo2XU10,
}

impl clap::ValueEnum for CacheType {
    fn value_variants<'a>() -> &'a [Self] {
        // Unknown is never a valid override
        &Self::VARIANTS[1..]
    }
    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        let name: &'static str = self.into();
        Some(clap::builder::PossibleValue::new(name))
    }
}

impl From<CacheType> for i32 {
    fn from(value: CacheType) -> Self {
        value as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, AsRefStr)]
pub enum HaloGame {
    Unknown,
    Halo1,
    Halo2,
    Halo3,
    Halo3ODST,
    HaloReach,
    Halo4,
    Halo2X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CacheGeneration {
    Gen1,
    Gen2,
    Gen3,
    Gen4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
pub enum CachePlatform {
    Xbox,
    Xbox360,
    XboxOne,
    PC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlatformArchitecture {
    X86,
    PowerPC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResourceCodec {
    Uncompressed,
    Deflate,
    Lzx,
    UnknownDeflate,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CacheFlags: u32 {
        const PRE_BETA = 1;
        const BETA = 2;
        const FLIGHT = 4;
        const ANNIVERSARY = 8;
        const MCC = 16;

        const MCC_FLIGHT = Self::MCC.bits() | Self::FLIGHT.bits();
        const PRE_RELEASE = Self::PRE_BETA.bits() | Self::BETA.bits() | Self::FLIGHT.bits();
    }
}

/// Static attributes shared by every build of a cache type.
struct TypeInfo {
    game: HaloGame,
    platform: CachePlatform,
    codec: Option<ResourceCodec>,
    flags: CacheFlags,
}

impl CacheType {
    fn info(self) -> TypeInfo {
        use CachePlatform::*;
        let (game, platform, codec, flags) = match self {
            Unknown => (HaloGame::Unknown, PC, None, CacheFlags::empty()),
            Halo1Xbox => (HaloGame::Halo1, Xbox, None, CacheFlags::empty()),
            Halo1PC | Halo1CE => (HaloGame::Halo1, PC, None, CacheFlags::empty()),
            Halo1AE => (HaloGame::Halo1, Xbox360, None, CacheFlags::ANNIVERSARY),
            MccHalo1 => (HaloGame::Halo1, PC, None, CacheFlags::ANNIVERSARY | CacheFlags::MCC),
            Halo2Beta => (HaloGame::Halo2, Xbox, None, CacheFlags::BETA),
            Halo2Xbox => (HaloGame::Halo2, Xbox, None, CacheFlags::empty()),
            Halo2Vista => (HaloGame::Halo2, PC, None, CacheFlags::empty()),
            MccHalo2 => (HaloGame::Halo2, PC, None, CacheFlags::ANNIVERSARY | CacheFlags::MCC),
            Halo3Alpha | Halo3Delta => (
                HaloGame::Halo3,
                Xbox360,
                Some(ResourceCodec::Uncompressed),
                CacheFlags::PRE_BETA,
            ),
            Halo3Beta => (HaloGame::Halo3, Xbox360, Some(ResourceCodec::Uncompressed), CacheFlags::BETA),
            Halo3Retail => (HaloGame::Halo3, Xbox360, None, CacheFlags::empty()),
            MccHalo3F6 => (HaloGame::Halo3, PC, None, CacheFlags::MCC | CacheFlags::MCC_FLIGHT),
            MccHalo3 | MccHalo3U4 | MccHalo3U6 | MccHalo3U9 | MccHalo3U12 | MccHalo3U13 => {
                (HaloGame::Halo3, PC, None, CacheFlags::MCC)
            }
            Halo3ODST => (HaloGame::Halo3ODST, Xbox360, None, CacheFlags::empty()),
            MccHalo3ODSTF3 => (HaloGame::Halo3ODST, PC, None, CacheFlags::MCC_FLIGHT),
            MccHalo3ODST | MccHalo3ODSTU3 | MccHalo3ODSTU4 | MccHalo3ODSTU7 | MccHalo3ODSTU8 => {
                (HaloGame::Halo3ODST, PC, None, CacheFlags::MCC)
            }
            HaloReachBeta => (HaloGame::HaloReach, Xbox360, None, CacheFlags::BETA),
            HaloReachRetail => (HaloGame::HaloReach, Xbox360, None, CacheFlags::empty()),
            MccHaloReach | MccHaloReachU3 | MccHaloReachU8 | MccHaloReachU10 | MccHaloReachU13 => {
                (HaloGame::HaloReach, PC, None, CacheFlags::MCC)
            }
            Halo4Beta => (HaloGame::Halo4, Xbox360, None, CacheFlags::BETA),
            Halo4Retail => (HaloGame::Halo4, Xbox360, Some(ResourceCodec::Lzx), CacheFlags::empty()),
            MccHalo4 => (HaloGame::Halo4, PC, Some(ResourceCodec::UnknownDeflate), CacheFlags::MCC),
            MccHalo4U4 | MccHalo4U6 => (HaloGame::Halo4, PC, Some(ResourceCodec::Deflate), CacheFlags::MCC),
            MccHalo2X => (HaloGame::Halo2X, PC, Some(ResourceCodec::UnknownDeflate), CacheFlags::MCC),
            MccHalo2XU8 | MccHalo2XU10 => (HaloGame::Halo2X, PC, Some(ResourceCodec::Deflate), CacheFlags::MCC),
        };
        TypeInfo {
            game,
            platform,
            codec,
            flags,
        }
    }

    pub fn game(self) -> HaloGame {
        self.info().game
    }

    pub fn generation(self) -> Option<CacheGeneration> {
        Some(match self.game() {
            HaloGame::Unknown => return None,
            HaloGame::Halo1 => CacheGeneration::Gen1,
            HaloGame::Halo2 => CacheGeneration::Gen2,
            HaloGame::Halo3 | HaloGame::Halo3ODST | HaloGame::HaloReach => CacheGeneration::Gen3,
            HaloGame::Halo4 | HaloGame::Halo2X => CacheGeneration::Gen4,
        })
    }

    /// Latest known cache type for an MCC game folder name.
    pub fn latest_for_folder(folder: &str) -> CacheType {
        match folder {
            "halo1" => MccHalo1,
            "halo3" => MccHalo3U12,
            "halo3odst" => MccHalo3ODSTU7,
            "haloreach" => MccHaloReachU10,
            "halo4" => MccHalo4U6,
            "groundhog" => MccHalo2XU10,
            _ => Unknown,
        }
    }
}

/// A single known build string with its per-build overrides.
struct BuildString {
    build: &'static str,
    cache_type: CacheType,
    string_ids: Option<&'static str>,
    codec: Option<ResourceCodec>,
    flags: Option<CacheFlags>,
}

const fn build(build: &'static str, cache_type: CacheType, string_ids: Option<&'static str>) -> BuildString {
    BuildString {
        build,
        cache_type,
        string_ids,
        codec: None,
        flags: None,
    }
}

const fn flight(build: &'static str, cache_type: CacheType, string_ids: &'static str) -> BuildString {
    BuildString {
        build,
        cache_type,
        string_ids: Some(string_ids),
        codec: None,
        flags: Some(CacheFlags::MCC_FLIGHT),
    }
}

const fn deflate(build: &'static str, cache_type: CacheType, string_ids: &'static str, flags: Option<CacheFlags>) -> BuildString {
    BuildString {
        build,
        cache_type,
        string_ids: Some(string_ids),
        codec: Some(ResourceCodec::Deflate),
        flags,
    }
}

#[rustfmt::skip]
static BUILD_STRINGS: &[BuildString] = &[
    build("01.01.14.2342", Halo1Xbox, None),
    BuildString { build: "01.07.30.0452", cache_type: Halo1PC, string_ids: None, codec: None, flags: Some(CacheFlags::BETA) },
    build("01.00.00.0564", Halo1PC, None),
    build("01.00.00.0609", Halo1CE, None),
    build("01.00.01.0563", Halo1AE, None),
    build("01.03.43.0000", MccHalo1, None),
    build("02.06.28.07902", Halo2Beta, None),
    build("02.09.27.09809", Halo2Xbox, None),
    build("11081.07.04.30.0934.main", Halo2Vista, None),
    build("06481.06.11.17.1330.alpha_relea", Halo3Alpha, Some("alpha_1117")),
    build("08117.07.03.07.1702.delta", Halo3Delta, Some("alpha_0307")),
    build("08172.07.03.08.2240.delta", Halo3Delta, Some("alpha_0308")),
    BuildString { build: "Mar  9 2007 22:22:32", cache_type: Halo3Beta, string_ids: Some("alpha_0308"), codec: None, flags: Some(CacheFlags::PRE_BETA) },
    build("09699.07.05.01.1534.delta", Halo3Beta, Some("beta")),
    build("11855.07.08.20.2317.halo3_ship", Halo3Retail, Some("retail")),
    build("11856.07.08.20.2332.release", Halo3Retail, Some("retail")),
    build("11729.07.08.10.0021.main", Halo3Retail, Some("retail")),
    build("12065.08.08.26.0819.halo3_ship", Halo3Retail, Some("retail")),
    flight("Jun  4 2020 20:29:31", MccHalo3, "U0"),
    flight("Jun 21 2020 16:34:20", MccHalo3, "U0"),
    build("Jun 25 2020 15:02:49", MccHalo3, Some("U0")),
    flight("Aug 11 2020 23:34:41", MccHalo3, "U0"),
    build("Aug 26 2020 21:24:11", MccHalo3, Some("U1")),
    build("Oct 21 2020 09:24:30", MccHalo3, Some("U1")),
    build("Nov 24 2020 15:47:48", MccHalo3, Some("U1")),
    flight("Oct  7 2020 03:55:07", MccHalo3U4, "U1"),
    flight("Feb 19 2021 11:19:43", MccHalo3U4, "U1"),
    flight("Mar  5 2021 08:45:13", MccHalo3U4, "U1"),
    build("Mar 14 2021 03:19:55", MccHalo3U4, Some("U1")),
    flight("May 19 2021 16:19:54", MccHalo3U4, "U1"),
    build("Jun  9 2021 09:25:41", MccHalo3U4, Some("U1")),
    build("Aug 25 2021 03:43:53", MccHalo3F6, Some("U1")),
    build("Sep 29 2021 09:17:56", MccHalo3U6, Some("U6")),
    build("Oct 11 2021 04:58:42", MccHalo3U6, Some("U6")),
    build("Nov  1 2021 06:16:14", MccHalo3U6, Some("U6")),
    build("Feb 15 2022 01:35:34", MccHalo3U9, Some("U6")),
    build("Apr  6 2022 10:48:27", MccHalo3U9, Some("U6")),
    build("Apr  6 2022 10:48:46", MccHalo3U9, Some("U6")),
    build("Apr 20 2022 11:55:21", MccHalo3U9, Some("U6")),
    build("Apr 20 2022 11:56:23", MccHalo3U9, Some("U6")),
    build("May  3 2022 12:38:41", MccHalo3U9, Some("U6")),
    build("Jun  8 2022 16:05:04", MccHalo3U9, Some("U6")),
    build("Jun  8 2022 16:06:30", MccHalo3U9, Some("U6")),
    build("Jul 21 2022 21:15:27", MccHalo3U9, Some("U6")),
    build("Aug 21 2022 17:23:29", MccHalo3U9, Some("U6")),
    build("Aug 21 2022 17:24:39", MccHalo3U9, Some("U6")),
    build("Oct 11 2022 04:34:53", MccHalo3U12, Some("U6")),
    build("Nov 16 2022 21:16:57", MccHalo3U12, Some("U6")),
    build("Nov 16 2022 21:18:10", MccHalo3U12, Some("U6")),
    build("May 22 2023 20:10:02", MccHalo3U13, Some("U13")),
    build("Jun 27 2023 08:39:36", MccHalo3U13, Some("U13")),
    build("13895.09.04.27.2201.atlas_relea", Halo3ODST, Some("odst")),
    flight("Aug 11 2020 06:58:27", MccHalo3ODST, "ODST U0"),
    flight("Aug 17 2020 01:12:27", MccHalo3ODST, "ODST U0"),
    flight("Aug 24 2020 08:37:26", MccHalo3ODST, "ODST U0"),
    build("Aug 28 2020 08:43:36", MccHalo3ODST, Some("ODST U0")),
    build("Sep 29 2020 10:59:04", MccHalo3ODST, Some("ODST U0")),
    build("Dec  4 2020 18:24:06", MccHalo3ODST, Some("ODST U0")),
    build("Aug 25 2021 03:35:05", MccHalo3ODSTF3, Some("ODST U0")),
    build("Sep 18 2021 21:15:55", MccHalo3ODSTU3, Some("ODST U3")),
    build("Feb 15 2022 01:59:47", MccHalo3ODSTU4, Some("ODST U3")),
    build("Apr  5 2022 14:16:52", MccHalo3ODSTU4, Some("ODST U3")),
    build("Apr  5 2022 14:16:35", MccHalo3ODSTU4, Some("ODST U3")),
    build("Apr 20 2022 11:53:15", MccHalo3ODSTU4, Some("ODST U3")),
    build("May  3 2022 12:27:08", MccHalo3ODSTU4, Some("ODST U3")),
    build("May  3 2022 12:27:56", MccHalo3ODSTU4, Some("ODST U3")),
    build("Jul 22 2022 05:55:30", MccHalo3ODSTU4, Some("ODST U3")),
    build("Aug 21 2022 17:29:59", MccHalo3ODSTU4, Some("ODST U3")),
    build("Aug 21 2022 17:30:28", MccHalo3ODSTU4, Some("ODST U3")),
    build("Oct 24 2022 03:07:19", MccHalo3ODSTU7, Some("ODST U3")),
    build("Nov 16 2022 20:57:46", MccHalo3ODSTU7, Some("ODST U3")),
    build("Nov 16 2022 20:59:16", MccHalo3ODSTU7, Some("ODST U3")),
    build("May 16 2023 11:44:41", MccHalo3ODSTU8, Some("ODST U8")),
    build("Jun 27 2023 08:39:51", MccHalo3ODSTU8, Some("ODST U8")),
    build("Jun 27 2023 08:39:50", MccHalo3ODSTU8, Some("ODST U8")),
    BuildString { build: "09449.10.03.25.1545.omaha_beta", cache_type: HaloReachBeta, string_ids: Some("beta"), codec: None, flags: Some(CacheFlags::PRE_BETA) },
    build("09730.10.04.09.1309.omaha_delta", HaloReachBeta, Some("beta")),
    build("11860.10.07.24.0147.omaha_relea", HaloReachRetail, Some("retail")),
    flight("Jun 24 2019 00:36:03", MccHaloReach, "U0"),
    flight("Jul 30 2019 14:17:16", MccHaloReach, "U0"),
    build("Oct 24 2019 15:56:32", MccHaloReach, Some("U0")),
    build("Jan 30 2020 16:55:25", MccHaloReach, Some("U2")),
    build("Mar 24 2020 12:10:36", MccHaloReach, Some("U2")),
    build("Jun  5 2020 10:40:14", MccHaloReachU3, Some("U2")),
    build("Oct 15 2020 18:23:50", MccHaloReachU3, Some("U2")),
    build("Nov 24 2020 18:32:37", MccHaloReachU3, Some("U2")),
    build("Mar  4 2021 13:14:28", MccHaloReachU3, Some("U6")),
    build("May 26 2021 10:02:45", MccHaloReachU3, Some("U6")),
    flight("Aug 11 2021 15:50:30", MccHaloReachU8, "U8"),
    build("Sep 13 2021 09:49:52", MccHaloReachU8, Some("U8")),
    build("Sep 17 2021 13:25:40", MccHaloReachU8, Some("U8")),
    build("Jan 13 2022 00:54:50", MccHaloReachU10, Some("U8")),
    build("Aug  5 2022 20:35:02", MccHaloReachU10, Some("U8")),
    build("Aug 31 2022 11:53:49", MccHaloReachU10, Some("U8")),
    build("Aug 31 2022 11:53:19", MccHaloReachU10, Some("U8")),
    build("Oct 12 2022 01:55:01", MccHaloReachU10, Some("U8")),
    build("Nov 16 2022 21:11:25", MccHaloReachU10, Some("U8")),
    build("Nov 16 2022 21:13:04", MccHaloReachU10, Some("U8")),
    build("Jun 21 2023 15:35:31", MccHaloReachU13, Some("U13")),
    build("Jun 27 2023 08:55:51", MccHaloReachU13, Some("U13")),
    build("Jun 27 2023 08:55:19", MccHaloReachU13, Some("U13")),
    build("Jul 16 2023 16:12:13", MccHaloReachU13, Some("U13")),
    build("Jul 16 2023 16:08:14", MccHaloReachU13, Some("U13")),
    build("14064.12.05.05.1011.beta", Halo4Beta, Some("beta")),
    build("20810.12.09.22.1647.main", Halo4Retail, Some("retail")),
    build("16531.12.07.05.0200.main", Halo4Retail, Some("retail")),
    build("17539.12.07.24.0200.main", Halo4Retail, Some("retail")),
    build("18223.12.08.06.0200.main", Halo4Retail, Some("retail")),
    build("18845.12.08.16.0200.main", Halo4Retail, Some("retail")),
    build("20190.12.09.05.0200.main", Halo4Retail, Some("retail")),
    build("20703.12.09.16.0400.main", Halo4Retail, Some("retail")),
    build("20744.12.09.18.0100.main", Halo4Retail, Some("retail")),
    build("20975.12.10.25.1337.main", Halo4Retail, Some("retail")),
    build("21122.12.11.21.0101.main", Halo4Retail, Some("retail")),
    build("21165.12.12.12.0112.main", Halo4Retail, Some("retail")),
    build("21339.13.02.05.0117.main", Halo4Retail, Some("retail")),
    build("21391.13.03.13.1711.main", Halo4Retail, Some("retail")),
    build("21401.13.04.23.1849.main", Halo4Retail, Some("retail")),
    build("21501.13.08.06.2311.main", Halo4Retail, Some("retail")),
    build("21522.13.10.17.1936.main", Halo4Retail, Some("retail")),
    flight("Oct 12 2020 08:13:40", MccHalo4, "U0"),
    build("Oct 26 2020 11:43:08", MccHalo4, Some("U0")),
    deflate("Mar 20 2021 04:23:02", MccHalo4, "U1", None),
    deflate("May 16 2021 10:41:44", MccHalo4, "U1", Some(CacheFlags::MCC_FLIGHT)),
    deflate("May 27 2021 15:23:34", MccHalo4, "U1", None),
    deflate("Sep 10 2021 06:54:23", MccHalo4, "U3", None),
    build("Feb  3 2022 19:02:31", MccHalo4U4, Some("U3")),
    build("Aug  8 2022 17:28:57", MccHalo4U4, Some("U3")),
    build("Oct 17 2022 21:26:14", MccHalo4U6, Some("U3")),
    build("Dec  6 2022 11:23:50", MccHalo4U6, Some("U3")),
    build("Dec  6 2022 11:26:37", MccHalo4U6, Some("U3")),
    build("Apr  1 2023 17:35:22", MccHalo4U6, Some("U3")),
    build("Jun 27 2023 08:46:47", MccHalo4U6, Some("U3")),
    build("Jun 27 2023 08:47:24", MccHalo4U6, Some("U3")),
    flight("Apr  9 2020 01:36:04", MccHalo2X, "U0"),
    build("Apr 13 2020 02:24:30", MccHalo2X, Some("U0")),
    build("May 10 2020 21:14:00", MccHalo2X, Some("U1")),
    build("May 12 2020 12:18:21", MccHalo2X, Some("U2")),
    build("Jul 25 2020 22:24:58", MccHalo2X, Some("U2")),
    build("Sep 30 2020 20:30:41", MccHalo2X, Some("U2")),
    deflate("Dec 25 2020 16:05:40", MccHalo2X, "U2", None),
    deflate("Sep 23 2021 02:46:19", MccHalo2X, "U6", None),
    deflate("Sep 17 2021 14:26:28", MccHalo2X, "U6", None),
    build("Feb 14 2022 19:18:28", MccHalo2XU8, Some("U6")),
    build("Jun 13 2022 13:44:24", MccHalo2XU8, Some("U6")),
    build("Oct 14 2022 21:11:35", MccHalo2XU10, Some("U6")),
    build("Dec  6 2022 11:13:38", MccHalo2XU10, Some("U6")),
    build("Dec  6 2022 11:13:46", MccHalo2XU10, Some("U6")),
    build("Jun 13 2023 20:21:18", MccHalo2XU10, Some("U6")),
    build("Jun 27 2023 08:47:43", MccHalo2XU10, Some("U6")),
    build("Jun 27 2023 08:47:52", MccHalo2XU10, Some("U6")),
];

/// Parses MCC-style build dates such as `Jun 25 2020 15:02:49`.
pub fn is_build_date(value: &str) -> bool {
    chrono::NaiveDateTime::parse_from_str(value.trim(), "%b %e %Y %H:%M:%S").is_ok()
}

/// Everything known about a detected build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetadata {
    pub cache_type: CacheType,
    pub game: HaloGame,
    pub generation: Option<CacheGeneration>,
    pub platform: CachePlatform,
    pub architecture: PlatformArchitecture,
    /// Key of the string-id scheme the build uses.
    pub string_ids: Option<&'static str>,
    pub resource_codec: ResourceCodec,
    #[serde(skip)]
    pub flags: CacheFlags,
}

impl CacheMetadata {
    fn from_entry(entry: &BuildString) -> Self {
        let info = entry.cache_type.info();
        let generation = entry.cache_type.generation();
        let default_codec = match generation {
            Some(g) if g >= CacheGeneration::Gen3 => ResourceCodec::Deflate,
            _ => ResourceCodec::Uncompressed,
        };
        Self {
            cache_type: entry.cache_type,
            game: info.game,
            generation,
            platform: info.platform,
            architecture: match info.platform {
                CachePlatform::Xbox360 => PlatformArchitecture::PowerPC,
                _ => PlatformArchitecture::X86,
            },
            string_ids: entry.string_ids,
            resource_codec: entry.codec.or(info.codec).unwrap_or(default_codec),
            flags: entry.flags.unwrap_or(info.flags),
        }
    }

    /// Metadata for an explicitly chosen cache type, using its first known build.
    pub fn for_type(cache_type: CacheType) -> Option<Self> {
        BUILD_STRINGS
            .iter()
            .find(|b| b.cache_type == cache_type)
            .map(Self::from_entry)
    }

    /// Looks up a build string, falling back to the map's location for
    /// date-like builds that are not in the table.
    pub fn from_build_string(build: &str, path: Option<&Path>) -> Option<Self> {
        if let Some(entry) = BUILD_STRINGS.iter().find(|b| b.build == build) {
            let metadata = Self::from_entry(entry);
            debug!("resolved cache type {:?}", metadata.cache_type);
            return Some(metadata);
        }
        if !is_build_date(build) {
            return None;
        }
        let fallback = path.map_or(Unknown, guess_cache_type);
        if fallback == Unknown {
            return None;
        }
        debug!("falling back to cache type {fallback:?} based on file path");
        Self::for_type(fallback)
    }

    pub fn is_pre_release(&self) -> bool {
        self.flags.intersects(CacheFlags::PRE_RELEASE)
    }
    pub fn is_mcc(&self) -> bool {
        self.flags.contains(CacheFlags::MCC)
    }
}

/// `.../<game>/maps/<file>` names the MCC game a map belongs to.
fn guess_cache_type(path: &Path) -> CacheType {
    let Some(parent) = path.parent() else {
        return Unknown;
    };
    if parent.file_name().is_none_or(|n| n != "maps") {
        return Unknown;
    }
    parent
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map_or(Unknown, CacheType::latest_for_folder)
}
