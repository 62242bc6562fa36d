/*!
 * Shared test fixtures: an ELF64 BPF object builder and protocol setup
 */

#![allow(dead_code)]

use nested_maps::ebpf::ExtensionObject;
use nested_maps::{NestedMapProtocol, SimulatedKernel};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const BPF_MAP_TYPE_HASH: u32 = 1;
pub const BPF_MAP_TYPE_HASH_OF_MAPS: u32 = 13;

const EM_BPF: u16 = 247;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;
const SHF_WRITE_ALLOC: u64 = 0x3;
const SHF_ALLOC_EXEC: u64 = 0x6;
const R_BPF_64_64: u64 = 1;

/// `r0 = 0; exit`
pub fn return_zero() -> Vec<u8> {
    let mut insns = Vec::new();
    insns.extend_from_slice(&[0xb7, 0, 0, 0, 0, 0, 0, 0]);
    insns.extend_from_slice(&[0x95, 0, 0, 0, 0, 0, 0, 0]);
    insns
}

/// `r1 = map; r0 = 0; exit`, with the map load at instruction 0
pub fn load_map_then_return() -> Vec<u8> {
    let mut insns = Vec::new();
    insns.extend_from_slice(&[0x18, 0x01, 0, 0, 0, 0, 0, 0]);
    insns.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
    insns.extend(return_zero());
    insns
}

#[derive(Debug, Clone)]
struct MapEntry {
    name: String,
    def: [u32; 5],
}

#[derive(Debug, Clone)]
struct ProgramEntry {
    section: String,
    function: String,
    insns: Vec<u8>,
    /// (instruction index, map name)
    relocations: Vec<(usize, String)>,
}

#[derive(Default)]
struct StringTable {
    bytes: Vec<u8>,
}

impl StringTable {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn add(&mut self, name: &str) -> u32 {
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        offset
    }
}

struct SectionEntry {
    name: u32,
    kind: u32,
    flags: u64,
    data: Vec<u8>,
    link: u32,
    info: u32,
    entsize: u64,
}

/// Builds a relocatable BPF object in the host's byte order
#[derive(Debug, Clone)]
pub struct ObjectBuilder {
    maps: Vec<MapEntry>,
    programs: Vec<ProgramEntry>,
    license: String,
    version: u32,
    machine: u16,
}

impl Default for ObjectBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self {
            maps: Vec::new(),
            programs: Vec::new(),
            license: "GPL".to_string(),
            version: 0xFFFF_FFFE,
            machine: EM_BPF,
        }
    }

    /// The object the demo binary expects: `outer_map` plus a classifier
    /// that references it
    pub fn standard() -> Self {
        Self::new()
            .map("outer_map", BPF_MAP_TYPE_HASH_OF_MAPS, 4, 4, 128)
            .program_with_map("classifier/test_func", "test_func", load_map_then_return(), "outer_map")
    }

    pub fn map(mut self, name: &str, kind: u32, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        self.maps.push(MapEntry {
            name: name.to_string(),
            def: [kind, key_size, value_size, max_entries, 0],
        });
        self
    }

    pub fn program(mut self, section: &str, function: &str, insns: Vec<u8>) -> Self {
        self.programs.push(ProgramEntry {
            section: section.to_string(),
            function: function.to_string(),
            insns,
            relocations: Vec::new(),
        });
        self
    }

    pub fn program_with_map(mut self, section: &str, function: &str, insns: Vec<u8>, map: &str) -> Self {
        self.programs.push(ProgramEntry {
            section: section.to_string(),
            function: function.to_string(),
            insns,
            relocations: vec![(0, map.to_string())],
        });
        self
    }

    pub fn license(mut self, license: &str) -> Self {
        self.license = license.to_string();
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut shstrtab = StringTable::new();
        let mut strtab = StringTable::new();
        let mut sections = vec![SectionEntry {
            name: 0,
            kind: 0,
            flags: 0,
            data: Vec::new(),
            link: 0,
            info: 0,
            entsize: 0,
        }];

        // (name offset, info, shndx, value, size)
        let mut symbols: Vec<(u32, u8, u16, u64, u64)> = vec![(0, 0, 0, 0, 0)];

        let maps_index = if self.maps.is_empty() {
            None
        } else {
            let index = sections.len();
            let mut data = Vec::new();
            for (i, map) in self.maps.iter().enumerate() {
                for field in map.def {
                    data.extend_from_slice(&field.to_ne_bytes());
                }
                let name = strtab.add(&map.name);
                symbols.push((name, 0x11, index as u16, (i * 20) as u64, 20));
            }
            sections.push(SectionEntry {
                name: shstrtab.add("maps"),
                kind: SHT_PROGBITS,
                flags: SHF_WRITE_ALLOC,
                data,
                link: 0,
                info: 0,
                entsize: 0,
            });
            Some(index)
        };

        let mut program_indices = Vec::new();
        for program in &self.programs {
            let index = sections.len();
            let name = strtab.add(&program.function);
            symbols.push((name, 0x12, index as u16, 0, program.insns.len() as u64));
            sections.push(SectionEntry {
                name: shstrtab.add(&program.section),
                kind: SHT_PROGBITS,
                flags: SHF_ALLOC_EXEC,
                data: program.insns.clone(),
                link: 0,
                info: 0,
                entsize: 0,
            });
            program_indices.push(index);
        }

        sections.push(SectionEntry {
            name: shstrtab.add("license"),
            kind: SHT_PROGBITS,
            flags: SHF_WRITE_ALLOC,
            data: {
                let mut bytes = self.license.as_bytes().to_vec();
                bytes.push(0);
                bytes
            },
            link: 0,
            info: 0,
            entsize: 0,
        });
        sections.push(SectionEntry {
            name: shstrtab.add("version"),
            kind: SHT_PROGBITS,
            flags: SHF_WRITE_ALLOC,
            data: self.version.to_ne_bytes().to_vec(),
            link: 0,
            info: 0,
            entsize: 0,
        });

        let symtab_index = sections.len();
        let mut symtab = Vec::new();
        for &(name, info, shndx, value, size) in &symbols {
            symtab.extend_from_slice(&name.to_ne_bytes());
            symtab.push(info);
            symtab.push(0);
            symtab.extend_from_slice(&shndx.to_ne_bytes());
            symtab.extend_from_slice(&value.to_ne_bytes());
            symtab.extend_from_slice(&size.to_ne_bytes());
        }
        sections.push(SectionEntry {
            name: shstrtab.add(".symtab"),
            kind: SHT_SYMTAB,
            flags: 0,
            data: symtab,
            link: (symtab_index + 1) as u32,
            info: 1,
            entsize: 24,
        });
        sections.push(SectionEntry {
            name: shstrtab.add(".strtab"),
            kind: SHT_STRTAB,
            flags: 0,
            data: strtab.bytes.clone(),
            link: 0,
            info: 0,
            entsize: 0,
        });

        for (program, &index) in self.programs.iter().zip(&program_indices) {
            if program.relocations.is_empty() || maps_index.is_none() {
                continue;
            }
            let mut data = Vec::new();
            for (insn_index, map_name) in &program.relocations {
                let map_position = self.maps.iter().position(|m| &m.name == map_name).unwrap_or(0);
                let symbol_index = (1 + map_position) as u64;
                data.extend_from_slice(&((*insn_index as u64) * 8).to_ne_bytes());
                data.extend_from_slice(&((symbol_index << 32) | R_BPF_64_64).to_ne_bytes());
            }
            let name = format!(".rel{}", program.section);
            sections.push(SectionEntry {
                name: shstrtab.add(&name),
                kind: SHT_REL,
                flags: 0,
                data,
                link: symtab_index as u32,
                info: index as u32,
                entsize: 16,
            });
        }

        let shstrndx = sections.len();
        let shstrtab_name = shstrtab.add(".shstrtab");
        sections.push(SectionEntry {
            name: shstrtab_name,
            kind: SHT_STRTAB,
            flags: 0,
            data: shstrtab.bytes.clone(),
            link: 0,
            info: 0,
            entsize: 0,
        });

        // Header, then section data, then the section header table
        let mut out = vec![0u8; 64];
        let mut offsets = Vec::with_capacity(sections.len());
        for section in &sections {
            while out.len() % 8 != 0 {
                out.push(0);
            }
            offsets.push(out.len() as u64);
            out.extend_from_slice(&section.data);
        }
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u64;

        for (section, offset) in sections.iter().zip(&offsets) {
            out.extend_from_slice(&section.name.to_ne_bytes());
            out.extend_from_slice(&section.kind.to_ne_bytes());
            out.extend_from_slice(&section.flags.to_ne_bytes());
            out.extend_from_slice(&0u64.to_ne_bytes());
            out.extend_from_slice(&offset.to_ne_bytes());
            out.extend_from_slice(&(section.data.len() as u64).to_ne_bytes());
            out.extend_from_slice(&section.link.to_ne_bytes());
            out.extend_from_slice(&section.info.to_ne_bytes());
            out.extend_from_slice(&8u64.to_ne_bytes());
            out.extend_from_slice(&section.entsize.to_ne_bytes());
        }

        let header = &mut out[..64];
        header[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        header[4] = 2;
        header[5] = if cfg!(target_endian = "little") { 1 } else { 2 };
        header[6] = 1;
        header[16..18].copy_from_slice(&1u16.to_ne_bytes());
        header[18..20].copy_from_slice(&self.machine.to_ne_bytes());
        header[20..24].copy_from_slice(&1u32.to_ne_bytes());
        header[40..48].copy_from_slice(&shoff.to_ne_bytes());
        header[52..54].copy_from_slice(&64u16.to_ne_bytes());
        header[58..60].copy_from_slice(&64u16.to_ne_bytes());
        header[60..62].copy_from_slice(&(sections.len() as u16).to_ne_bytes());
        header[62..64].copy_from_slice(&(shstrndx as u16).to_ne_bytes());
        out
    }

    /// Write the object into a fresh temporary directory
    pub fn write(&self) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_bpf.o");
        std::fs::write(&path, self.build()).unwrap();
        (dir, path)
    }
}

/// Open `builder`'s object on a fresh simulated kernel
pub fn open_object(builder: &ObjectBuilder) -> (Arc<SimulatedKernel>, ExtensionObject) {
    let kernel = Arc::new(SimulatedKernel::new());
    let (_dir, path) = builder.write();
    let object = ExtensionObject::open(&path, kernel.clone()).unwrap();
    (kernel, object)
}

/// Standard object opened, bound and loaded
pub fn loaded_protocol() -> (Arc<SimulatedKernel>, NestedMapProtocol) {
    let (kernel, object) = open_object(&ObjectBuilder::standard());
    let mut protocol = NestedMapProtocol::new(object, "outer_map");
    protocol.bind().unwrap();
    protocol.load().unwrap();
    (kernel, protocol)
}
