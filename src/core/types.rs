/*!
 * Core Types
 * Identifiers, map kinds and creation parameters shared across the crate
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::fd::RawFd;

/// Result of a raw kernel call; the error is the errno the kernel reported
pub type SysResult<T> = nix::Result<T>;

/// Common result type for nested map operations
pub type NestedResult<T> = Result<T, super::errors::NestedMapError>;

/// Kernel-global map identifier
///
/// Durable and comparable, but carries no lifetime: it must be resolved into a
/// [`MapHandle`](crate::core::guard::MapHandle) before it can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapId(pub u32);

impl MapId {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MapId {
    fn from(id: u32) -> Self {
        MapId(id)
    }
}

/// Map kinds understood by the crate (values are `BPF_MAP_TYPE_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    Hash,
    Array,
    ArrayOfMaps,
    HashOfMaps,
}

impl MapKind {
    /// Kernel map type number
    pub const fn as_raw(self) -> u32 {
        match self {
            MapKind::Hash => 1,
            MapKind::Array => 2,
            MapKind::ArrayOfMaps => 12,
            MapKind::HashOfMaps => 13,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MapKind::Hash),
            2 => Some(MapKind::Array),
            12 => Some(MapKind::ArrayOfMaps),
            13 => Some(MapKind::HashOfMaps),
            _ => None,
        }
    }

    /// True for table-of-tables kinds whose values are inner map ids
    #[inline]
    pub const fn is_map_of_maps(self) -> bool {
        matches!(self, MapKind::ArrayOfMaps | MapKind::HashOfMaps)
    }

    #[inline]
    pub const fn is_array(self) -> bool {
        matches!(self, MapKind::Array | MapKind::ArrayOfMaps)
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapKind::Hash => "hash",
            MapKind::Array => "array",
            MapKind::ArrayOfMaps => "array_of_maps",
            MapKind::HashOfMaps => "hash_of_maps",
        };
        f.write_str(name)
    }
}

/// Flags for element updates (`BPF_ANY`, `BPF_NOEXIST`, `BPF_EXIST`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFlags {
    /// Create or overwrite
    #[default]
    Any,
    /// Create only
    NoExist,
    /// Overwrite only
    Exist,
}

impl UpdateFlags {
    pub const fn as_raw(self) -> u64 {
        match self {
            UpdateFlags::Any => 0,
            UpdateFlags::NoExist => 1,
            UpdateFlags::Exist => 2,
        }
    }
}

/// Parameters for creating a kernel map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSpec {
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub name: Option<String>,
}

impl MapSpec {
    pub fn new(kind: MapKind, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self {
            kind,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            name: None,
        }
    }

    /// Map with u32 keys and u32 values
    pub fn u32_to_u32(kind: MapKind, max_entries: u32) -> Self {
        Self::new(kind, 4, 4, max_entries)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Whether a map of this shape may be stored in an outer map whose
    /// inner template has shape `template`
    pub fn matches_template(&self, template: &MapSpec) -> bool {
        let capacity_ok = !self.kind.is_array() || self.max_entries == template.max_entries;
        self.kind == template.kind
            && self.key_size == template.key_size
            && self.value_size == template.value_size
            && self.flags == template.flags
            && capacity_ok
    }
}

/// Kernel-reported description of a map fd (`struct bpf_map_info` subset)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub id: MapId,
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub name: String,
}

impl MapInfo {
    /// Shape of this map as creation parameters
    pub fn to_spec(&self) -> MapSpec {
        let spec = MapSpec::new(self.kind, self.key_size, self.value_size, self.max_entries)
            .with_flags(self.flags);
        if self.name.is_empty() {
            spec
        } else {
            spec.with_name(self.name.clone())
        }
    }
}

/// Fixed-size plain values that cross the syscall boundary in native byte order
pub trait PlainValue: Sized + Copy {
    const SIZE: usize;

    fn to_ne_vec(self) -> Vec<u8>;

    fn from_ne_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_plain_value {
    ($($ty:ty),*) => {
        $(
            impl PlainValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn to_ne_vec(self) -> Vec<u8> {
                    self.to_ne_bytes().to_vec()
                }

                #[inline]
                fn from_ne_slice(bytes: &[u8]) -> Option<Self> {
                    let array = bytes.try_into().ok()?;
                    Some(<$ty>::from_ne_bytes(array))
                }
            }
        )*
    };
}

impl_plain_value!(u32, i32, u64);

impl PlainValue for MapId {
    const SIZE: usize = 4;

    fn to_ne_vec(self) -> Vec<u8> {
        self.0.to_ne_vec()
    }

    fn from_ne_slice(bytes: &[u8]) -> Option<Self> {
        u32::from_ne_slice(bytes).map(MapId)
    }
}

/// Raw fd as stored in a map-of-maps update value
#[inline]
pub fn fd_value(fd: RawFd) -> Vec<u8> {
    fd.to_ne_vec()
}
