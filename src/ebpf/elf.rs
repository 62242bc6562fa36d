/*!
 * Object File Reader
 * Minimal ELF64 reader for compiled BPF objects
 *
 * Reads exactly what loading needs: the legacy `maps` section, program
 * sections with their map relocations, and the `license` / `version`
 * sections. Objects must have the host's byte order, as the kernel only
 * accepts native instructions.
 */

use super::types::{MapDef, MapRelocation, ProgramDef};
use crate::core::limits::{BPF_INSN_SIZE, EM_BPF, LEGACY_MAP_DEF_SIZE};
use crate::core::types::{MapKind, MapSpec};
use thiserror::Error;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const REL_SIZE: usize = 16;

const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_REL: u32 = 9;
const SHF_EXECINSTR: u64 = 0x4;
const STT_FUNC: u8 = 2;

const BPF_LD_IMM64: u8 = 0x18;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElfError {
    #[error("file truncated at offset {0}")]
    Truncated(usize),

    #[error("not an ELF file")]
    BadMagic,

    #[error("only 64-bit ELF objects are supported")]
    UnsupportedClass,

    #[error("object byte order does not match the host")]
    EndianMismatch,

    #[error("not a BPF object (machine {0})")]
    NotBpf(u16),

    #[error("unsupported map type {kind} for map {name}")]
    UnsupportedMap { name: String, kind: u32 },

    #[error("malformed object: {0}")]
    Malformed(String),
}

/// Declarations read from a compiled object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectFile {
    pub maps: Vec<MapDef>,
    pub programs: Vec<ProgramDef>,
    pub license: String,
    pub kern_version: u32,
}

#[derive(Debug, Clone)]
struct Section {
    name: String,
    kind: u32,
    flags: u64,
    offset: usize,
    size: usize,
    link: u32,
    info: u32,
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    info: u8,
    shndx: u16,
    value: u64,
}

fn bytes_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ElfError> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or(ElfError::Truncated(offset))
}

/// `base + delta`, or `Truncated` when the sum leaves the address space
fn offset_at(base: usize, delta: usize) -> Result<usize, ElfError> {
    base.checked_add(delta).ok_or(ElfError::Truncated(base))
}

/// The `index`th `size`-byte entry of a table starting at `table`
fn entry_at(data: &[u8], table: usize, index: usize, size: usize) -> Result<&[u8], ElfError> {
    let delta = index.checked_mul(size).ok_or(ElfError::Truncated(table))?;
    bytes_at(data, offset_at(table, delta)?, size)
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, ElfError> {
    let b = bytes_at(data, offset, 2)?;
    Ok(u16::from_ne_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, ElfError> {
    let b = bytes_at(data, offset, 4)?;
    Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, ElfError> {
    let b = bytes_at(data, offset, 8)?;
    let mut array = [0u8; 8];
    array.copy_from_slice(b);
    Ok(u64::from_ne_bytes(array))
}

fn to_usize(value: u64) -> Result<usize, ElfError> {
    usize::try_from(value).map_err(|_| ElfError::Malformed(format!("offset {value} out of range")))
}

/// NUL-terminated string starting at `offset`
fn read_cstr(data: &[u8], offset: usize) -> Result<String, ElfError> {
    let tail = data.get(offset..).ok_or(ElfError::Truncated(offset))?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

impl ObjectFile {
    pub fn new(maps: Vec<MapDef>, programs: Vec<ProgramDef>, license: impl Into<String>) -> Self {
        Self {
            maps,
            programs,
            license: license.into(),
            kern_version: 0,
        }
    }

    /// Parse a compiled BPF ELF object
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        let ident = bytes_at(data, 0, 16)?;
        if ident[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if ident[4] != ELFCLASS64 {
            return Err(ElfError::UnsupportedClass);
        }
        let host = if cfg!(target_endian = "little") { ELFDATA2LSB } else { ELFDATA2MSB };
        if ident[5] != host {
            return Err(ElfError::EndianMismatch);
        }
        bytes_at(data, 0, EHDR_SIZE)?;

        let machine = read_u16(data, 18)?;
        if machine != EM_BPF {
            return Err(ElfError::NotBpf(machine));
        }

        let sections = read_sections(data)?;
        let symbols = read_symbols(data, &sections)?;

        let maps_index = sections.iter().position(|s| s.name == "maps");
        let (maps, map_symbols) = match maps_index {
            Some(index) => read_maps(data, &sections[index], index, &symbols)?,
            None => (Vec::new(), Vec::new()),
        };

        let mut programs = Vec::new();
        for (index, section) in sections.iter().enumerate() {
            let executable = section.kind == SHT_PROGBITS && section.flags & SHF_EXECINSTR != 0;
            if !executable || section.size == 0 || section.name == ".text" {
                continue;
            }
            if section.size % BPF_INSN_SIZE != 0 {
                return Err(ElfError::Malformed(format!(
                    "section {} is not a whole number of instructions",
                    section.name
                )));
            }

            let name = symbols
                .iter()
                .find(|s| usize::from(s.shndx) == index && s.info & 0xf == STT_FUNC)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| section.name.clone());
            let insns = bytes_at(data, section.offset, section.size)?.to_vec();

            let mut program = ProgramDef::new(name, section.name.clone(), insns);
            program.relocations =
                read_relocations(data, &sections, index, &symbols, maps_index, &map_symbols, &program.insns)?;
            programs.push(program);
        }

        let license = match sections.iter().find(|s| s.name == "license") {
            Some(s) => read_cstr(bytes_at(data, s.offset, s.size)?, 0)?,
            None => String::new(),
        };
        let kern_version = match sections.iter().find(|s| s.name == "version") {
            Some(s) if s.size >= 4 => read_u32(data, s.offset)?,
            _ => 0,
        };

        Ok(Self {
            maps,
            programs,
            license,
            kern_version,
        })
    }

    pub fn find_map(&self, name: &str) -> Option<usize> {
        self.maps.iter().position(|m| m.name == name)
    }
}

fn read_sections(data: &[u8]) -> Result<Vec<Section>, ElfError> {
    let shoff = to_usize(read_u64(data, 40)?)?;
    let shentsize = usize::from(read_u16(data, 58)?);
    let shnum = usize::from(read_u16(data, 60)?);
    let shstrndx = usize::from(read_u16(data, 62)?);

    if shnum == 0 {
        return Ok(Vec::new());
    }
    if shentsize != SHDR_SIZE {
        return Err(ElfError::Malformed(format!("section header size {shentsize}")));
    }

    let mut raw = Vec::with_capacity(shnum);
    for i in 0..shnum {
        let header = entry_at(data, shoff, i, SHDR_SIZE)?;
        raw.push((
            read_u32(header, 0)?,
            Section {
                name: String::new(),
                kind: read_u32(header, 4)?,
                flags: read_u64(header, 8)?,
                offset: to_usize(read_u64(header, 24)?)?,
                size: to_usize(read_u64(header, 32)?)?,
                link: read_u32(header, 40)?,
                info: read_u32(header, 44)?,
            },
        ));
    }

    let strtab_offset = raw
        .get(shstrndx)
        .map(|(_, s)| s.offset)
        .ok_or_else(|| ElfError::Malformed("missing section name table".to_string()))?;

    raw.into_iter()
        .map(|(name_offset, mut section)| {
            section.name = read_cstr(data, offset_at(strtab_offset, name_offset as usize)?)?;
            Ok(section)
        })
        .collect()
}

fn read_symbols(data: &[u8], sections: &[Section]) -> Result<Vec<Symbol>, ElfError> {
    let Some(symtab) = sections.iter().find(|s| s.kind == SHT_SYMTAB) else {
        return Ok(Vec::new());
    };
    let strtab = sections
        .get(symtab.link as usize)
        .ok_or_else(|| ElfError::Malformed("symbol table has no string table".to_string()))?;

    (0..symtab.size / SYM_SIZE)
        .map(|i| {
            let sym = entry_at(data, symtab.offset, i, SYM_SIZE)?;
            let name_offset = read_u32(sym, 0)? as usize;
            Ok(Symbol {
                name: read_cstr(data, offset_at(strtab.offset, name_offset)?)?,
                info: sym[4],
                shndx: read_u16(sym, 6)?,
                value: read_u64(sym, 8)?,
            })
        })
        .collect()
}

/// Legacy `struct bpf_map_def` entries, ordered by offset
fn read_maps(
    data: &[u8],
    section: &Section,
    index: usize,
    symbols: &[Symbol],
) -> Result<(Vec<MapDef>, Vec<Symbol>), ElfError> {
    let mut map_symbols: Vec<Symbol> = symbols
        .iter()
        .filter(|s| usize::from(s.shndx) == index && !s.name.is_empty())
        .cloned()
        .collect();
    map_symbols.sort_by_key(|s| s.value);

    if map_symbols.is_empty() {
        return Ok((Vec::new(), map_symbols));
    }
    let def_size = section.size / map_symbols.len();
    if def_size < LEGACY_MAP_DEF_SIZE {
        return Err(ElfError::Malformed(format!("map definitions of {def_size} bytes")));
    }

    let mut maps = Vec::with_capacity(map_symbols.len());
    for symbol in &map_symbols {
        let def = bytes_at(data, offset_at(section.offset, to_usize(symbol.value)?)?, LEGACY_MAP_DEF_SIZE)?;
        let raw_kind = read_u32(def, 0)?;
        let kind = MapKind::from_raw(raw_kind).ok_or_else(|| ElfError::UnsupportedMap {
            name: symbol.name.clone(),
            kind: raw_kind,
        })?;
        let spec = MapSpec::new(
            kind,
            read_u32(def, 4)?,
            read_u32(def, 8)?,
            read_u32(def, 12)?,
        )
        .with_flags(read_u32(def, 16)?)
        .with_name(symbol.name.clone());

        maps.push(MapDef {
            name: symbol.name.clone(),
            spec,
        });
    }
    Ok((maps, map_symbols))
}

fn read_relocations(
    data: &[u8],
    sections: &[Section],
    program_index: usize,
    symbols: &[Symbol],
    maps_index: Option<usize>,
    map_symbols: &[Symbol],
    insns: &[u8],
) -> Result<Vec<MapRelocation>, ElfError> {
    let mut relocations = Vec::new();

    for rel in sections
        .iter()
        .filter(|s| s.kind == SHT_REL && s.info as usize == program_index)
    {
        for i in 0..rel.size / REL_SIZE {
            let entry = entry_at(data, rel.offset, i, REL_SIZE)?;
            let offset = to_usize(read_u64(entry, 0)?)?;
            let sym_index = (read_u64(entry, 8)? >> 32) as usize;

            let symbol = symbols
                .get(sym_index)
                .ok_or_else(|| ElfError::Malformed(format!("relocation symbol {sym_index}")))?;
            if maps_index != Some(usize::from(symbol.shndx)) {
                return Err(ElfError::Malformed(format!(
                    "unsupported relocation against {}",
                    symbol.name
                )));
            }

            let insn_index = offset / BPF_INSN_SIZE;
            if insns.get(insn_index * BPF_INSN_SIZE) != Some(&BPF_LD_IMM64) {
                return Err(ElfError::Malformed(format!(
                    "relocation at instruction {insn_index} is not ld_imm64"
                )));
            }

            let map_index = map_symbols
                .iter()
                .position(|s| s.value == symbol.value)
                .ok_or_else(|| ElfError::Malformed(format!("no map at {}", symbol.name)))?;
            relocations.push(MapRelocation {
                insn_index,
                map_index,
            });
        }
    }
    Ok(relocations)
}
