//! Category mapper: collapses fine category labels into coarser display groups.
//!
//! Nationality and visa grouping is ordered substring containment against
//! fixed keyword lists. The first list that matches wins; a label that
//! matches nothing lands in the default bucket. Every mapper is total.
//!
//! Age is always stored at 5-year resolution (`AgeBand`); the medium level
//! collapses it into a decade/generation bucket (`Generation`).

use crate::types::Granularity;
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Nationality ──────────────────────────────────────────────────────────────

const GREATER_CHINA: &[&str] = &[
    "중국", "한국계 중국인", "대만", "홍콩",
    "China", "Taiwan", "Hong Kong",
];
const SOUTHEAST_ASIA: &[&str] = &[
    "베트남", "태국", "필리핀", "인도네시아", "미얀마", "캄보디아", "동티모르", "말레이시아", "라오스",
    "Vietnam", "Thailand", "Philippines", "Indonesia", "Myanmar", "Cambodia", "Timor", "Malaysia", "Laos",
];
const CENTRAL_ASIA: &[&str] = &[
    "우즈베키스탄", "카자흐스탄", "키르기스스탄", "몽골", "타지키스탄",
    "Uzbekistan", "Kazakhstan", "Kyrgyzstan", "Mongolia", "Tajikistan",
];
const SOUTH_ASIA: &[&str] = &[
    "네팔", "방글라데시", "스리랑카", "파키스탄", "인도",
    "Nepal", "Bangladesh", "Sri Lanka", "Pakistan", "India",
];
const DEVELOPED: &[&str] = &[
    "미국", "캐나다", "영국", "호주", "뉴질랜드", "일본", "프랑스", "독일", "러시아",
    "United States", "USA", "Canada", "United Kingdom", "Australia", "New Zealand",
    "Japan", "France", "Germany", "Russia",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NationalityGroup {
    GreaterChina,
    SoutheastAsia,
    CentralAsia,
    SouthAsia,
    Developed,
    Other,
}

impl NationalityGroup {
    /// Priority order used for matching. Order matters: "인도네시아"
    /// contains "인도", so Southeast Asia must be tried before South Asia.
    const MATCH_ORDER: [(NationalityGroup, &'static [&'static str]); 5] = [
        (Self::GreaterChina,  GREATER_CHINA),
        (Self::SoutheastAsia, SOUTHEAST_ASIA),
        (Self::CentralAsia,   CENTRAL_ASIA),
        (Self::SouthAsia,     SOUTH_ASIA),
        (Self::Developed,     DEVELOPED),
    ];

    pub fn of(label: &str) -> Self {
        Self::MATCH_ORDER
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| label.contains(k)))
            .map_or(Self::Other, |(group, _)| *group)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::GreaterChina  => "Greater China",
            Self::SoutheastAsia => "Southeast Asia",
            Self::CentralAsia   => "Central Asia",
            Self::SouthAsia     => "South Asia",
            Self::Developed     => "North America/Europe/Japan",
            Self::Other         => "Other",
        }
    }

    pub fn continent(&self) -> Continent {
        match self {
            Self::GreaterChina | Self::SoutheastAsia | Self::CentralAsia | Self::SouthAsia => {
                Continent::Asia
            }
            Self::Developed => Continent::Developed,
            Self::Other     => Continent::OtherRegion,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Continent {
    Asia,
    Developed,
    OtherRegion,
}

impl Continent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Asia        => "Asia",
            Self::Developed   => "Western/Developed",
            Self::OtherRegion => "Other Region",
        }
    }
}

pub fn map_nationality(label: &str, level: Granularity) -> String {
    match level {
        Granularity::Fine   => label.to_string(),
        Granularity::Medium => NationalityGroup::of(label).label().to_string(),
        Granularity::Coarse => NationalityGroup::of(label).continent().label().to_string(),
    }
}

// ── Visa / status ────────────────────────────────────────────────────────────

const UNSKILLED: &[&str] = &["E-9", "E-10", "H-2", "비전문취업", "선원취업", "방문취업"];
const PROFESSIONAL: &[&str] = &[
    "E-1", "E-2", "E-3", "E-4", "E-5", "E-6", "E-7",
    "교수", "회화", "연구", "기술", "전문",
];
const STUDENT: &[&str] = &["D-2", "D-4", "유학", "연수"];
const RESIDENCY: &[&str] = &[
    "F-2", "F-4", "F-5", "F-6", "거주", "재외동포", "영주", "결혼이민",
];
const MARRIAGE: &[&str] = &["F-6", "결혼", "Marriage", "marriage"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VisaGroup {
    UnskilledLabor,
    Professional,
    Student,
    Residency,
    Temporary,
}

impl VisaGroup {
    const MATCH_ORDER: [(VisaGroup, &'static [&'static str]); 4] = [
        (Self::UnskilledLabor, UNSKILLED),
        (Self::Professional,   PROFESSIONAL),
        (Self::Student,        STUDENT),
        (Self::Residency,      RESIDENCY),
    ];

    pub fn of(label: &str) -> Self {
        Self::MATCH_ORDER
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| label.contains(k)))
            .map_or(Self::Temporary, |(group, _)| *group)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::UnskilledLabor => "Unskilled Labor (E-9/H-2)",
            Self::Professional   => "Professional (E-7 etc.)",
            Self::Student        => "Study/Training (D-2/D-4)",
            Self::Residency      => "Residency/Compatriot (F series)",
            Self::Temporary      => "Other/Temporary",
        }
    }

    pub fn purpose(&self) -> VisaPurpose {
        match self {
            Self::UnskilledLabor | Self::Professional => VisaPurpose::EconomicActivity,
            Self::Residency                           => VisaPurpose::Settlement,
            Self::Student | Self::Temporary           => VisaPurpose::NonEconomic,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VisaPurpose {
    EconomicActivity,
    Settlement,
    NonEconomic,
}

impl VisaPurpose {
    pub fn label(&self) -> &'static str {
        match self {
            Self::EconomicActivity => "Economic Activity",
            Self::Settlement       => "Settlement/Immigration",
            Self::NonEconomic      => "Non-economic/Other",
        }
    }
}

/// Marriage-migrant statuses. Matched on the raw label because the medium
/// taxonomy folds them into `Residency`.
pub fn is_marriage_visa(label: &str) -> bool {
    MARRIAGE.iter().any(|k| label.contains(k))
}

pub fn map_visa(label: &str, level: Granularity) -> String {
    match level {
        Granularity::Fine   => label.to_string(),
        Granularity::Medium => VisaGroup::of(label).label().to_string(),
        Granularity::Coarse => VisaGroup::of(label).purpose().label().to_string(),
    }
}

// ── Age ──────────────────────────────────────────────────────────────────────

/// 5-year age band, the internal resolution of the cube.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgeBand {
    #[serde(rename = "00-04")] Age00To04,
    #[serde(rename = "05-09")] Age05To09,
    #[serde(rename = "10-14")] Age10To14,
    #[serde(rename = "15-19")] Age15To19,
    #[serde(rename = "20-24")] Age20To24,
    #[serde(rename = "25-29")] Age25To29,
    #[serde(rename = "30-34")] Age30To34,
    #[serde(rename = "35-39")] Age35To39,
    #[serde(rename = "40-44")] Age40To44,
    #[serde(rename = "45-49")] Age45To49,
    #[serde(rename = "50-54")] Age50To54,
    #[serde(rename = "55-59")] Age55To59,
    #[serde(rename = "60-64")] Age60To64,
    #[serde(rename = "65+")]   Age65Plus,
}

impl AgeBand {
    pub const ALL: [AgeBand; 14] = [
        Self::Age00To04, Self::Age05To09, Self::Age10To14, Self::Age15To19,
        Self::Age20To24, Self::Age25To29, Self::Age30To34, Self::Age35To39,
        Self::Age40To44, Self::Age45To49, Self::Age50To54, Self::Age55To59,
        Self::Age60To64, Self::Age65Plus,
    ];

    /// Band containing `age` whole years.
    pub fn for_age(age: u32) -> Self {
        let idx = (age / 5).min(13) as usize;
        Self::ALL[idx]
    }

    /// Parse a raw age label ("23", "20-24세", "65세 이상", "25 years").
    /// Only the leading integer is significant; labels without one are
    /// unclassifiable.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw.replace('세', "").split_whitespace().collect();
        let digits: String = cleaned.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok().map(Self::for_age)
    }

    pub fn lower_bound(&self) -> u32 {
        5 * (*self as u32)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Age00To04 => "00-04",
            Self::Age05To09 => "05-09",
            Self::Age10To14 => "10-14",
            Self::Age15To19 => "15-19",
            Self::Age20To24 => "20-24",
            Self::Age25To29 => "25-29",
            Self::Age30To34 => "30-34",
            Self::Age35To39 => "35-39",
            Self::Age40To44 => "40-44",
            Self::Age45To49 => "45-49",
            Self::Age50To54 => "50-54",
            Self::Age55To59 => "55-59",
            Self::Age60To64 => "60-64",
            Self::Age65Plus => "65+",
        }
    }

    pub fn generation(&self) -> Generation {
        match self.lower_bound() {
            0..=19  => Generation::Under20,
            20..=29 => Generation::Twenties,
            30..=39 => Generation::Thirties,
            40..=49 => Generation::Forties,
            50..=59 => Generation::Fifties,
            _       => Generation::SixtyPlus,
        }
    }
}

impl fmt::Display for AgeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    Under20,
    Twenties,
    Thirties,
    Forties,
    Fifties,
    SixtyPlus,
}

impl Generation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Under20   => "0-19",
            Self::Twenties  => "20-29",
            Self::Thirties  => "30-39",
            Self::Forties   => "40-49",
            Self::Fifties   => "50-59",
            Self::SixtyPlus => "60+",
        }
    }
}

/// Age has no third level; `Coarse` renders like `Medium`.
pub fn map_age(band: AgeBand, level: Granularity) -> String {
    match level {
        Granularity::Fine => band.label().to_string(),
        Granularity::Medium | Granularity::Coarse => band.generation().label().to_string(),
    }
}
