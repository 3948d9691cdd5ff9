use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric product classifier.
///
/// One numeric space holds two representations: bitmasks (the OR of
/// registered primitive bits) and registered value identities, which never
/// overlap the bitmask space. Plain bitwise operators are always available;
/// [`FeedtypeDb`] implements the full algebra over both representations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Feedtype(pub u32);

impl Feedtype {
    /// Matches nothing.
    pub const NONE: Feedtype = Feedtype(0);
    /// Wildcard covering every registered bit and value.
    ///
    /// Raw bitwise operators treat it as all 32 bits, including ones no
    /// table defines. [`FeedtypeDb`] treats it as the whole table, so
    /// algebra results never carry undefined bits.
    pub const ANY: Feedtype = Feedtype(u32::MAX);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns true when the two masks share at least one bit.
    pub fn overlaps(self, other: Feedtype) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Feedtype {
    type Output = Feedtype;

    fn bitor(self, rhs: Feedtype) -> Feedtype {
        Feedtype(self.0 | rhs.0)
    }
}

impl BitOrAssign for Feedtype {
    fn bitor_assign(&mut self, rhs: Feedtype) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Feedtype {
    type Output = Feedtype;

    fn bitand(self, rhs: Feedtype) -> Feedtype {
        Feedtype(self.0 & rhs.0)
    }
}

impl BitAndAssign for Feedtype {
    fn bitand_assign(&mut self, rhs: Feedtype) {
        self.0 &= rhs.0;
    }
}

impl Not for Feedtype {
    type Output = Feedtype;

    fn not(self) -> Feedtype {
        Feedtype(!self.0)
    }
}

impl fmt::Display for Feedtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Feedtype::NONE => return f.write_str("NONE"),
            Feedtype::ANY => return f.write_str("ANY"),
            _ => {}
        }
        let mut rest = self.0;
        let mut parts: Vec<&str> = Vec::new();
        for (name, members) in STANDARD_MASKS {
            let value = standard_mask_value(members);
            if value != 0 && rest & value == value {
                parts.push(name);
                rest &= !value;
            }
        }
        for (name, index) in STANDARD_BITS {
            let bit = 1_u32 << index;
            if rest & bit != 0 {
                parts.push(name);
                rest &= !bit;
            }
        }
        let mut first = true;
        for part in parts {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(part)?;
            first = false;
        }
        if rest != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{rest:#010x}")?;
        }
        Ok(())
    }
}

/// Primitive bits of the standard feedtype table, by bit index.
pub const STANDARD_BITS: [(&str, u32); 31] = [
    ("PPS", 0),
    ("DDS", 1),
    ("HDS", 2),
    ("IDS", 3),
    ("SPARE", 4),
    ("UNIWISC", 5),
    ("PCWS", 6),
    ("FSL2", 7),
    ("FSL3", 8),
    ("FSL4", 9),
    ("FSL5", 10),
    ("GPSSRC", 11),
    ("CONDUIT", 12),
    ("FNEXRAD", 13),
    ("LIGHTNING", 14),
    ("WSI", 15),
    ("DIFAX", 16),
    ("FAA604", 17),
    ("GPS", 18),
    ("FNMOC", 19),
    ("GEM", 20),
    ("NIMAGE", 21),
    ("NTEXT", 22),
    ("NGRID", 23),
    ("NPOINT", 24),
    ("NGRAPH", 25),
    ("NOTHER", 26),
    ("NEXRAD3", 27),
    ("NEXRAD2", 28),
    ("NXRDSRC", 29),
    ("EXP", 30),
];

/// Composite masks of the standard table, largest first.
pub const STANDARD_MASKS: [(&str, &[&str]); 3] = [
    ("NPORT", &["NTEXT", "NGRID", "NPOINT", "NGRAPH", "NOTHER"]),
    ("WMO", &["PPS", "DDS", "HDS"]),
    ("DDPLUS", &["PPS", "DDS"]),
];

/// Alternative names of standard primitive bits.
pub const STANDARD_ALIASES: [(&str, &str); 8] = [
    ("HRS", "HDS"),
    ("MCIDAS", "UNIWISC"),
    ("ACARS", "PCWS"),
    ("PROFILER", "FSL2"),
    ("NMC2", "CONDUIT"),
    ("NLDN", "LIGHTNING"),
    ("NNEXRAD", "NEXRAD3"),
    ("CRAFT", "NEXRAD2"),
];

fn standard_bit(name: &str) -> Option<u32> {
    STANDARD_BITS
        .iter()
        .find(|(bit_name, _)| *bit_name == name)
        .map(|(_, index)| 1_u32 << index)
}

fn standard_mask_value(members: &[&str]) -> u32 {
    members
        .iter()
        .filter_map(|name| standard_bit(name))
        .fold(0, |acc, bit| acc | bit)
}

/// Errors returned by feedtype registration and algebra operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedtypeError {
    /// A registration happened after a step that forbids it.
    #[error("invocation order: {0}")]
    InvocationOrder(&'static str),
    /// The name is already bound to an entry.
    #[error("feedtype name already defined: {0}")]
    NameDefined(String),
    /// The numeric value is already bound to an entry.
    #[error("feedtype value already defined: {0:#x}")]
    ValueDefined(u32),
    /// Bit index outside `0..=31`.
    #[error("invalid bit index: {0}")]
    InvalidBit(u32),
    /// Value identity that collides with the bitmask space (or is zero).
    #[error("invalid feedtype value {0:#x}: value lies in the bitmask space")]
    InvalidValue(u32),
    /// A referenced name is not registered.
    #[error("unknown feedtype name: {0}")]
    UnknownName(String),
    /// A mask definition referenced a value entry.
    #[error("feedtype {0} is not a mask")]
    NotMask(String),
    /// A mask definition ended up with no bits set.
    #[error("feedtype mask {0} has no bits set")]
    EmptyMask(String),
    /// A value definition carried a mask but no leaf members.
    #[error("feedtype value {0} has a mask but no leaf members")]
    MaskWithoutLeaves(String),
    /// Another value already names the same (leaf-set, mask) combination.
    #[error("feedtype {name} duplicates the members of {existing}")]
    CombinationDefined { name: String, existing: String },
    /// No registered entry corresponds to an operand or a computed result.
    #[error("no such entry: {0}")]
    NoSuchEntry(String),
    /// Malformed feedtype expression.
    #[error("invalid feedtype expression: {0}")]
    Parse(String),
}

/// Leaf members of a value entry, held in descending order.
///
/// Ordering compares elements pairwise from the largest down; the first
/// mismatch decides (larger leaf first) and, on an identical prefix, the
/// longer set sorts first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LeafSet(Vec<u32>);

impl LeafSet {
    pub fn from_set(set: &BTreeSet<u32>) -> Self {
        Self(set.iter().rev().copied().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, leaf: u32) -> bool {
        self.0.contains(&leaf)
    }

    pub fn iter(&self) -> impl Iterator<Item = Feedtype> + '_ {
        self.0.iter().map(|v| Feedtype(*v))
    }
}

impl Ord for LeafSet {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            if a != b {
                return b.cmp(a);
            }
        }
        other.0.len().cmp(&self.0.len())
    }
}

impl PartialOrd for LeafSet {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lookup key of interior entries: larger mask first, then leaf order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberKey {
    mask: u32,
    leaves: LeafSet,
}

impl Ord for MemberKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .mask
            .cmp(&self.mask)
            .then_with(|| self.leaves.cmp(&other.leaves))
    }
}

impl PartialOrd for MemberKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One registered feedtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedtypeEntry {
    /// Named bitmask: a primitive bit or an OR of primitive bits.
    Mask { name: String, value: Feedtype },
    /// Indivisible value identity.
    Leaf { name: String, value: Feedtype },
    /// Named union of leaf entries plus an extra bitmask.
    Interior {
        name: String,
        value: Feedtype,
        mask: Feedtype,
        leaves: LeafSet,
    },
}

impl FeedtypeEntry {
    pub fn name(&self) -> &str {
        match self {
            FeedtypeEntry::Mask { name, .. }
            | FeedtypeEntry::Leaf { name, .. }
            | FeedtypeEntry::Interior { name, .. } => name,
        }
    }

    pub fn value(&self) -> Feedtype {
        match self {
            FeedtypeEntry::Mask { value, .. }
            | FeedtypeEntry::Leaf { value, .. }
            | FeedtypeEntry::Interior { value, .. } => *value,
        }
    }
}

/// An operand decomposed into leaf members and an extra mask.
#[derive(Debug, Default)]
struct Members {
    leaves: BTreeSet<u32>,
    mask: u32,
}

/// Append-only registry of named feedtypes and the algebra over them.
///
/// Bits must be registered before any value; entries are immutable once
/// added, so a table built at startup can be shared read-only.
#[derive(Debug, Clone, Default)]
pub struct FeedtypeDb {
    entries: Vec<FeedtypeEntry>,
    by_name: HashMap<String, usize>,
    by_value: HashMap<u32, usize>,
    by_members: BTreeMap<MemberKey, usize>,
    or_mask: u32,
    has_values: bool,
}

impl FeedtypeDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of the standard primitive bits, composite masks and aliases.
    pub fn standard() -> Self {
        let mut db = Self::new();
        for (name, index) in STANDARD_BITS {
            let bit = 1_u32 << index;
            db.or_mask |= bit;
            db.push(FeedtypeEntry::Mask {
                name: name.to_string(),
                value: Feedtype(bit),
            });
        }
        for (alias, target) in STANDARD_ALIASES {
            if let Some(bit) = standard_bit(target) {
                db.push(FeedtypeEntry::Mask {
                    name: alias.to_string(),
                    value: Feedtype(bit),
                });
            }
        }
        for (name, members) in STANDARD_MASKS {
            db.push(FeedtypeEntry::Mask {
                name: name.to_string(),
                value: Feedtype(standard_mask_value(members)),
            });
        }
        db
    }

    fn push(&mut self, entry: FeedtypeEntry) -> usize {
        let index = self.entries.len();
        self.by_name.insert(entry.name().to_ascii_uppercase(), index);
        self.by_value.entry(entry.value().0).or_insert(index);
        if let FeedtypeEntry::Interior { mask, leaves, .. } = &entry {
            self.by_members.insert(
                MemberKey {
                    mask: mask.0,
                    leaves: leaves.clone(),
                },
                index,
            );
        }
        self.entries.push(entry);
        index
    }

    fn check_name(&self, name: &str) -> Result<(), FeedtypeError> {
        if name.is_empty() || name.contains('|') {
            return Err(FeedtypeError::Parse(name.to_string()));
        }
        if self.by_name.contains_key(&name.to_ascii_uppercase()) {
            return Err(FeedtypeError::NameDefined(name.to_string()));
        }
        Ok(())
    }

    /// Registers a primitive bit (`1 << index`).
    pub fn add_bit(&mut self, name: &str, index: u32) -> Result<Feedtype, FeedtypeError> {
        if self.has_values {
            return Err(FeedtypeError::InvocationOrder(
                "bits must be registered before any value",
            ));
        }
        if index > 31 {
            return Err(FeedtypeError::InvalidBit(index));
        }
        self.check_name(name)?;
        let bit = 1_u32 << index;
        if self.or_mask & bit != 0 {
            return Err(FeedtypeError::ValueDefined(bit));
        }
        self.or_mask |= bit;
        self.push(FeedtypeEntry::Mask {
            name: name.to_string(),
            value: Feedtype(bit),
        });
        Ok(Feedtype(bit))
    }

    /// Registers a named mask built from other mask names.
    pub fn add_mask(
        &mut self,
        name: &str,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<Feedtype, FeedtypeError> {
        self.check_name(name)?;
        let mut value = 0_u32;
        for member in include {
            value |= self.mask_named(member)?;
        }
        for member in exclude {
            value &= !self.mask_named(member)?;
        }
        if value == 0 {
            return Err(FeedtypeError::EmptyMask(name.to_string()));
        }
        self.push(FeedtypeEntry::Mask {
            name: name.to_string(),
            value: Feedtype(value),
        });
        Ok(Feedtype(value))
    }

    fn mask_named(&self, name: &str) -> Result<u32, FeedtypeError> {
        match self.by_name(name) {
            Some(FeedtypeEntry::Mask { value, .. }) => Ok(value.0),
            Some(_) => Err(FeedtypeError::NotMask(name.to_string())),
            None => Err(FeedtypeError::UnknownName(name.to_string())),
        }
    }

    /// Registers a value identity.
    ///
    /// Included masks are ORed into the extra mask; included values add
    /// their leaves. Excludes remove the same. A value with no leaf members
    /// becomes a leaf entry.
    pub fn add_value(
        &mut self,
        name: &str,
        value: u32,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<Feedtype, FeedtypeError> {
        self.check_name(name)?;
        if value == 0 || self.is_mask(Feedtype(value)) {
            return Err(FeedtypeError::InvalidValue(value));
        }
        if self.by_value.contains_key(&value) {
            return Err(FeedtypeError::ValueDefined(value));
        }
        let mut members = Members::default();
        for member in include {
            let entry = self
                .by_name(member)
                .ok_or_else(|| FeedtypeError::UnknownName(member.to_string()))?;
            match entry {
                FeedtypeEntry::Mask { value, .. } => members.mask |= value.0,
                FeedtypeEntry::Leaf { value, .. } => {
                    members.leaves.insert(value.0);
                }
                FeedtypeEntry::Interior { mask, leaves, .. } => {
                    members.mask |= mask.0;
                    members.leaves.extend(leaves.iter().map(|ft| ft.0));
                }
            }
        }
        for member in exclude {
            let entry = self
                .by_name(member)
                .ok_or_else(|| FeedtypeError::UnknownName(member.to_string()))?;
            match entry {
                FeedtypeEntry::Mask { value, .. } => members.mask &= !value.0,
                FeedtypeEntry::Leaf { value, .. } => {
                    members.leaves.remove(&value.0);
                }
                FeedtypeEntry::Interior { mask, leaves, .. } => {
                    members.mask &= !mask.0;
                    for leaf in leaves.iter() {
                        members.leaves.remove(&leaf.0);
                    }
                }
            }
        }

        let entry = if members.leaves.is_empty() {
            if members.mask != 0 {
                return Err(FeedtypeError::MaskWithoutLeaves(name.to_string()));
            }
            FeedtypeEntry::Leaf {
                name: name.to_string(),
                value: Feedtype(value),
            }
        } else {
            let key = MemberKey {
                mask: members.mask,
                leaves: LeafSet::from_set(&members.leaves),
            };
            if let Some(existing) = self.by_members.get(&key) {
                return Err(FeedtypeError::CombinationDefined {
                    name: name.to_string(),
                    existing: self.entries[*existing].name().to_string(),
                });
            }
            FeedtypeEntry::Interior {
                name: name.to_string(),
                value: Feedtype(value),
                mask: Feedtype(key.mask),
                leaves: key.leaves,
            }
        };
        self.has_values = true;
        self.push(entry);
        Ok(Feedtype(value))
    }

    /// Registers a leaf value with no members.
    pub fn add_leaf(&mut self, name: &str, value: u32) -> Result<Feedtype, FeedtypeError> {
        self.add_value(name, value, &[], &[])
    }

    /// Case-insensitive lookup by name.
    pub fn by_name(&self, name: &str) -> Option<&FeedtypeEntry> {
        self.by_name
            .get(&name.to_ascii_uppercase())
            .map(|index| &self.entries[*index])
    }

    pub fn by_value(&self, value: Feedtype) -> Option<&FeedtypeEntry> {
        self.by_value.get(&value.0).map(|index| &self.entries[*index])
    }

    pub fn entries(&self) -> impl Iterator<Item = &FeedtypeEntry> {
        self.entries.iter()
    }

    /// OR of every registered primitive bit.
    pub fn any(&self) -> Feedtype {
        Feedtype(self.or_mask)
    }

    /// Whether `ft` lies in the bitmask space of this table.
    pub fn is_mask(&self, ft: Feedtype) -> bool {
        ft == Feedtype::ANY || ft.0 & !self.or_mask == 0
    }

    fn members(&self, ft: Feedtype) -> Result<Members, FeedtypeError> {
        if ft == Feedtype::ANY {
            return Ok(Members {
                leaves: self
                    .entries
                    .iter()
                    .filter_map(|entry| match entry {
                        FeedtypeEntry::Leaf { value, .. } => Some(value.0),
                        _ => None,
                    })
                    .collect(),
                mask: self.or_mask,
            });
        }
        if self.is_mask(ft) {
            return Ok(Members {
                leaves: BTreeSet::new(),
                mask: ft.0,
            });
        }
        match self.by_value(ft) {
            Some(FeedtypeEntry::Leaf { value, .. }) => Ok(Members {
                leaves: BTreeSet::from([value.0]),
                mask: 0,
            }),
            Some(FeedtypeEntry::Interior { mask, leaves, .. }) => Ok(Members {
                leaves: leaves.iter().map(|leaf| leaf.0).collect(),
                mask: mask.0,
            }),
            Some(FeedtypeEntry::Mask { value, .. }) => Ok(Members {
                leaves: BTreeSet::new(),
                mask: value.0,
            }),
            None => Err(FeedtypeError::NoSuchEntry(format!("{:#x}", ft.0))),
        }
    }

    /// Returns the canonical feedtype for a (leaf-set, mask) combination.
    fn resolve(&self, members: Members) -> Result<Feedtype, FeedtypeError> {
        match members.leaves.len() {
            0 => Ok(Feedtype(members.mask)),
            1 if members.mask == 0 => Ok(Feedtype(
                members.leaves.iter().next().copied().unwrap_or_default(),
            )),
            _ => {
                let key = MemberKey {
                    mask: members.mask,
                    leaves: LeafSet::from_set(&members.leaves),
                };
                self.by_members
                    .get(&key)
                    .map(|index| self.entries[*index].value())
                    .ok_or_else(|| {
                        let leaves: Vec<String> =
                            key.leaves.iter().map(|ft| format!("{:#x}", ft.0)).collect();
                        FeedtypeError::NoSuchEntry(format!(
                            "leaves [{}] with mask {:#x}",
                            leaves.join(", "),
                            key.mask
                        ))
                    })
            }
        }
    }

    pub fn union(&self, a: Feedtype, b: Feedtype) -> Result<Feedtype, FeedtypeError> {
        if a == b || b.is_none() {
            return Ok(a);
        }
        if a.is_none() {
            return Ok(b);
        }
        if a == Feedtype::ANY || b == Feedtype::ANY {
            return Ok(Feedtype::ANY);
        }
        if self.is_mask(a) && self.is_mask(b) {
            return Ok(a | b);
        }
        let (x, y) = (self.members(a)?, self.members(b)?);
        self.resolve(Members {
            leaves: x.leaves.union(&y.leaves).copied().collect(),
            mask: x.mask | y.mask,
        })
    }

    pub fn intersect(&self, a: Feedtype, b: Feedtype) -> Result<Feedtype, FeedtypeError> {
        if a == b {
            return Ok(a);
        }
        if a.is_none() || b.is_none() {
            return Ok(Feedtype::NONE);
        }
        if a == Feedtype::ANY {
            return Ok(b);
        }
        if b == Feedtype::ANY {
            return Ok(a);
        }
        if self.is_mask(a) && self.is_mask(b) {
            return Ok(a & b);
        }
        let (x, y) = (self.members(a)?, self.members(b)?);
        self.resolve(Members {
            leaves: x.leaves.intersection(&y.leaves).copied().collect(),
            mask: x.mask & y.mask,
        })
    }

    /// Everything in `a` that is not in `b`.
    pub fn difference(&self, a: Feedtype, b: Feedtype) -> Result<Feedtype, FeedtypeError> {
        if a == b || a.is_none() || b == Feedtype::ANY {
            return Ok(Feedtype::NONE);
        }
        if b.is_none() {
            return Ok(a);
        }
        if self.is_mask(a) && self.is_mask(b) {
            if a != Feedtype::ANY {
                return Ok(a & !b);
            }
            if !self.has_values {
                return Ok(Feedtype(self.or_mask & !b.0));
            }
        }
        let (x, y) = (self.members(a)?, self.members(b)?);
        self.resolve(Members {
            leaves: x.leaves.difference(&y.leaves).copied().collect(),
            mask: x.mask & !y.mask,
        })
    }

    /// Whether `particular` shares any class of data with `general`.
    pub fn matches(&self, general: Feedtype, particular: Feedtype) -> Result<bool, FeedtypeError> {
        if general == particular {
            return Ok(!general.is_none());
        }
        if general.is_none() || particular.is_none() {
            return Ok(false);
        }
        if general == Feedtype::ANY || particular == Feedtype::ANY {
            return Ok(true);
        }
        if self.is_mask(general) && self.is_mask(particular) {
            return Ok(general.overlaps(particular));
        }
        let (x, y) = (self.members(general)?, self.members(particular)?);
        Ok(x.mask & y.mask != 0 || x.leaves.intersection(&y.leaves).next().is_some())
    }

    /// Whether everything in `inner` is also in `outer`.
    pub fn covers(&self, outer: Feedtype, inner: Feedtype) -> Result<bool, FeedtypeError> {
        if inner.is_none() || outer == inner || outer == Feedtype::ANY {
            return Ok(true);
        }
        if outer.is_none() || inner == Feedtype::ANY {
            return Ok(false);
        }
        if self.is_mask(outer) && self.is_mask(inner) {
            return Ok(inner.0 & !outer.0 == 0);
        }
        let (x, y) = (self.members(outer)?, self.members(inner)?);
        Ok(y.mask & !x.mask == 0 && y.leaves.is_subset(&x.leaves))
    }

    /// Parses `NAME|NAME|0x10|42` into a feedtype, folding with [`union`].
    ///
    /// [`union`]: FeedtypeDb::union
    pub fn parse(&self, expr: &str) -> Result<Feedtype, FeedtypeError> {
        let mut result = Feedtype::NONE;
        let mut seen = false;
        for token in expr.split('|').map(str::trim) {
            if token.is_empty() {
                return Err(FeedtypeError::Parse(expr.to_string()));
            }
            seen = true;
            let ft = if token.eq_ignore_ascii_case("ANY") {
                return Ok(Feedtype::ANY);
            } else if token.eq_ignore_ascii_case("NONE") {
                Feedtype::NONE
            } else if let Some(entry) = self.by_name(token) {
                entry.value()
            } else if let Some(hex) = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
            {
                u32::from_str_radix(hex, 16)
                    .map(Feedtype)
                    .map_err(|_| FeedtypeError::Parse(token.to_string()))?
            } else if let Ok(number) = token.parse::<u32>() {
                Feedtype(number)
            } else {
                return Err(FeedtypeError::UnknownName(token.to_string()));
            };
            result = self.union(result, ft)?;
        }
        if !seen {
            return Err(FeedtypeError::Parse(expr.to_string()));
        }
        Ok(result)
    }

    /// Human-readable rendering using registered names where possible.
    pub fn format(&self, ft: Feedtype) -> String {
        match ft {
            Feedtype::NONE => return "NONE".to_string(),
            Feedtype::ANY => return "ANY".to_string(),
            _ => {}
        }
        if let Some(entry) = self.by_value(ft) {
            return entry.name().to_string();
        }
        if self.is_mask(ft) {
            let mut names: Vec<&str> = Vec::new();
            let mut rest = ft.0;
            for entry in &self.entries {
                if let FeedtypeEntry::Mask { name, value } = entry {
                    if value.0.count_ones() == 1 && rest & value.0 != 0 {
                        names.push(name);
                        rest &= !value.0;
                    }
                }
            }
            if rest == 0 && !names.is_empty() {
                return names.join("|");
            }
        }
        format!("{:#x}", ft.0)
    }
}
