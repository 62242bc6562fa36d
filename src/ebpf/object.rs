/*!
 * Extension Object
 * Open, load and unload a compiled object's maps and programs
 */

use super::elf::ObjectFile;
use super::traits::BpfSyscalls;
use super::types::{program_type_by_section, MapDef, ObjectState, ProgramDef, ProgramLoad};
use crate::core::errors::NestedMapError;
use crate::core::limits::BPF_INSN_SIZE;
use crate::core::types::{MapSpec, NestedResult};
use nix::errno::Errno;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// `BPF_PSEUDO_MAP_FD` marker in the source register of `ld_imm64`
const BPF_PSEUDO_MAP_FD: u8 = 1;

#[derive(Debug)]
struct ObjectMap {
    def: MapDef,
    /// Shape of inner maps, recorded when a template is bound
    inner_spec: Option<MapSpec>,
    fd: Option<RawFd>,
}

#[derive(Debug)]
struct ObjectProgram {
    def: ProgramDef,
    fd: Option<RawFd>,
}

/// A compiled object: declared maps and programs plus their kernel fds
/// once loaded
pub struct ExtensionObject {
    path: PathBuf,
    maps: Vec<ObjectMap>,
    programs: Vec<ObjectProgram>,
    license: String,
    kern_version: u32,
    state: ObjectState,
    kernel: Arc<dyn BpfSyscalls>,
}

impl ExtensionObject {
    /// Read and parse an object file, then infer its program types
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, kernel: Arc<dyn BpfSyscalls>) -> NestedResult<Self> {
        let path = path.as_ref();
        let open_failed = |reason: String| NestedMapError::OpenFailed {
            path: path.display().to_string(),
            reason,
        };

        let data = std::fs::read(path).map_err(|e| open_failed(e.to_string()))?;
        let file = ObjectFile::parse(&data).map_err(|e| open_failed(e.to_string()))?;

        let mut object = Self::from_file(path, file, kernel);
        object.infer_program_types()?;

        info!(
            maps = object.maps.len(),
            programs = object.programs.len(),
            "extension object opened"
        );
        Ok(object)
    }

    /// Wrap already-parsed declarations; program types are left as given
    pub fn from_file(path: impl Into<PathBuf>, file: ObjectFile, kernel: Arc<dyn BpfSyscalls>) -> Self {
        Self {
            path: path.into(),
            maps: file
                .maps
                .into_iter()
                .map(|def| ObjectMap {
                    def,
                    inner_spec: None,
                    fd: None,
                })
                .collect(),
            programs: file
                .programs
                .into_iter()
                .map(|def| ObjectProgram { def, fd: None })
                .collect(),
            license: file.license,
            kern_version: file.kern_version,
            state: ObjectState::Opened,
            kernel,
        }
    }

    /// Set each program's type from its section name
    ///
    /// Programs that already carry a type are kept; any section with no known
    /// prefix aborts the whole open.
    pub fn infer_program_types(&mut self) -> NestedResult<()> {
        for program in self.programs.iter_mut().filter(|p| p.def.prog_type.is_none()) {
            let (prog_type, attach) = program_type_by_section(&program.def.section).ok_or_else(|| {
                NestedMapError::ProgramTypeInference {
                    section: program.def.section.clone(),
                }
            })?;
            program.def.prog_type = Some(prog_type);
            program.def.expected_attach_type = attach;
            debug!(section = %program.def.section, ?prog_type, "program type inferred");
        }
        Ok(())
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn state(&self) -> ObjectState {
        self.state
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.state == ObjectState::Loaded
    }

    #[inline]
    pub fn kernel(&self) -> &Arc<dyn BpfSyscalls> {
        &self.kernel
    }

    pub fn map_names(&self) -> impl Iterator<Item = &str> {
        self.maps.iter().map(|m| m.def.name.as_str())
    }

    pub fn programs(&self) -> impl Iterator<Item = &ProgramDef> {
        self.programs.iter().map(|p| &p.def)
    }

    /// Index and declaration of a named map
    pub fn find_map(&self, name: &str) -> Option<(usize, &MapDef)> {
        self.maps
            .iter()
            .enumerate()
            .find(|(_, m)| m.def.name == name)
            .map(|(i, m)| (i, &m.def))
    }

    pub(crate) fn map_def(&self, index: usize) -> Option<&MapDef> {
        self.maps.get(index).map(|m| &m.def)
    }

    pub(crate) fn inner_spec(&self, index: usize) -> Option<&MapSpec> {
        self.maps.get(index).and_then(|m| m.inner_spec.as_ref())
    }

    /// Record the shape inner maps of a map-of-maps must have
    pub(crate) fn set_inner_spec(&mut self, index: usize, spec: MapSpec) -> Result<(), Errno> {
        if self.state != ObjectState::Opened {
            return Err(Errno::EBUSY);
        }
        let map = self.maps.get_mut(index).ok_or(Errno::ENOENT)?;
        if !map.def.spec.kind.is_map_of_maps() {
            return Err(Errno::EINVAL);
        }
        map.inner_spec = Some(spec);
        Ok(())
    }

    /// Runtime fd of a map; only present while loaded
    pub(crate) fn map_fd(&self, index: usize) -> Option<RawFd> {
        if !self.is_loaded() {
            return None;
        }
        self.maps.get(index).and_then(|m| m.fd)
    }

    /// Create every map, then load every program
    ///
    /// On failure everything created so far is closed again and the object
    /// stays `Opened`.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&mut self) -> NestedResult<()> {
        if self.state != ObjectState::Opened {
            return Err(NestedMapError::LoadFailed {
                code: Errno::EBUSY as i32,
                reason: format!("object is {}", self.state),
            });
        }

        if let Err(e) = self.create_maps().and_then(|()| self.load_programs()) {
            let _ = self.close_all();
            return Err(e);
        }

        self.state = ObjectState::Loaded;
        Ok(())
    }

    fn create_maps(&mut self) -> NestedResult<()> {
        for index in 0..self.maps.len() {
            let fd = self.create_map(index)?;
            self.maps[index].fd = Some(fd);
        }
        Ok(())
    }

    fn create_map(&self, index: usize) -> NestedResult<RawFd> {
        let map = &self.maps[index];
        let load_failed = |errno: Errno, what: &str| NestedMapError::LoadFailed {
            code: errno as i32,
            reason: format!("{what} {}: {errno}", map.def.name),
        };

        if !map.def.spec.kind.is_map_of_maps() {
            return self
                .kernel
                .map_create(&map.def.spec, None)
                .map_err(|e| load_failed(e, "failed to create map"));
        }

        // The kernel copies the inner shape at creation, so a transient
        // template is enough
        let inner_spec = map
            .inner_spec
            .as_ref()
            .ok_or_else(|| load_failed(Errno::EINVAL, "no inner map template bound for"))?;
        let template = self
            .kernel
            .map_create(inner_spec, None)
            .map_err(|e| load_failed(e, "failed to create inner template for"))?;
        let outer = self.kernel.map_create(&map.def.spec, Some(template));
        if let Err(e) = self.kernel.close(template) {
            warn!(fd = template, error = %e, "failed to close inner template");
        }
        outer.map_err(|e| load_failed(e, "failed to create map"))
    }

    fn load_programs(&mut self) -> NestedResult<()> {
        for index in 0..self.programs.len() {
            let request = self.program_load(index)?;
            let fd = self
                .kernel
                .prog_load(&request)
                .map_err(|errno| NestedMapError::LoadFailed {
                    code: errno as i32,
                    reason: format!("failed to load program {}: {errno}", request.name),
                })?;
            debug!(program = %request.name, fd, "program loaded");
            self.programs[index].fd = Some(fd);
        }
        Ok(())
    }

    /// Load request with map references patched to this object's map fds
    fn program_load(&self, index: usize) -> NestedResult<ProgramLoad> {
        let def = &self.programs[index].def;
        let prog_type = def.prog_type.ok_or_else(|| NestedMapError::ProgramTypeInference {
            section: def.section.clone(),
        })?;

        let mut insns = def.insns.clone();
        for reloc in &def.relocations {
            let fd = self
                .maps
                .get(reloc.map_index)
                .and_then(|m| m.fd)
                .ok_or_else(|| NestedMapError::LoadFailed {
                    code: Errno::ENOENT as i32,
                    reason: format!("program {} references missing map {}", def.name, reloc.map_index),
                })?;
            let base = reloc.insn_index * BPF_INSN_SIZE;
            let insn = insns
                .get_mut(base..base + BPF_INSN_SIZE)
                .ok_or_else(|| NestedMapError::LoadFailed {
                    code: Errno::EINVAL as i32,
                    reason: format!("relocation past end of program {}", def.name),
                })?;
            insn[1] = (insn[1] & 0x0f) | (BPF_PSEUDO_MAP_FD << 4);
            insn[4..8].copy_from_slice(&fd.to_ne_bytes());
        }

        Ok(ProgramLoad {
            name: def.name.clone(),
            prog_type,
            expected_attach_type: def.expected_attach_type,
            insns,
            license: self.license.clone(),
            kern_version: self.kern_version,
        })
    }

    /// Close every fd the object holds, returning the first error
    fn close_all(&mut self) -> Result<(), Errno> {
        let mut first_error = None;
        let fds = self
            .programs
            .iter_mut()
            .filter_map(|p| p.fd.take())
            .chain(self.maps.iter_mut().filter_map(|m| m.fd.take()));

        for fd in fds.collect::<Vec<_>>() {
            if let Err(e) = self.kernel.close(fd) {
                warn!(fd, error = %e, "failed to close object fd");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release every kernel object; terminal
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn unload(&mut self) -> NestedResult<()> {
        if self.state != ObjectState::Loaded {
            return Err(NestedMapError::UnloadFailed {
                reason: format!("object is {}", self.state),
            });
        }

        self.state = ObjectState::Unloaded;
        self.close_all().map_err(|errno| NestedMapError::UnloadFailed {
            reason: errno.to_string(),
        })
    }
}

impl Drop for ExtensionObject {
    fn drop(&mut self) {
        if self.is_loaded() {
            debug!(path = %self.path.display(), "unloading extension object on drop");
            let _ = self.close_all();
        }
    }
}

impl std::fmt::Debug for ExtensionObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionObject")
            .field("path", &self.path)
            .field("maps", &self.maps)
            .field("programs", &self.programs.len())
            .field("state", &self.state)
            .finish()
    }
}
