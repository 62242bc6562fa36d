/*!
 * Simulated Kernel
 * In-memory map and program tables for testing and unsupported platforms
 */

use super::traits::BpfSyscalls;
use super::types::{BpfPlatform, ProgramLoad};
use crate::core::limits::{BPF_INSN_SIZE, OBJ_NAME_LEN, SIM_FIRST_FD, SIM_MAX_FDS};
use crate::core::types::{MapId, MapInfo, MapKind, MapSpec, PlainValue, SysResult, UpdateFlags};
use ahash::RandomState;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::RawFd;
use tracing::{debug, trace};

type FastMap<K, V> = HashMap<K, V, RandomState>;

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    MapCreate,
    MapUpdate,
    MapLookup,
    MapDelete,
    MapGetFdById,
    MapInfo,
    ProgLoad,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    op: SimOp,
    skip: usize,
    errno: Errno,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdTarget {
    Map(MapId),
    Prog(u32),
}

#[derive(Debug)]
struct SimMap {
    spec: MapSpec,
    /// Shape every value must have, for map-of-maps kinds
    inner_template: Option<MapSpec>,
    entries: FastMap<Vec<u8>, Vec<u8>>,
    /// Open fds plus outer-map slots referencing this map
    refs: usize,
    charge: u64,
}

#[derive(Debug)]
struct SimProg {
    name: String,
    refs: usize,
}

#[derive(Debug)]
struct SimState {
    next_map_id: u32,
    next_prog_id: u32,
    fds: FastMap<RawFd, FdTarget>,
    maps: FastMap<MapId, SimMap>,
    progs: FastMap<u32, SimProg>,
    memlock_limit: Option<u64>,
    memlock_used: u64,
    faults: Vec<Fault>,
}

/// Simulation-based kernel
///
/// Models what the protocol can observe of the real kernel: per-process fds,
/// kernel-global ids, reference-counted maps that disappear once neither an
/// fd nor an outer-map slot holds them, map-of-maps shape checks and a
/// locked-memory budget.
#[derive(Debug)]
pub struct SimulatedKernel {
    state: Mutex<SimState>,
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_map_id: 1,
                next_prog_id: 1,
                fds: FastMap::default(),
                maps: FastMap::default(),
                progs: FastMap::default(),
                memlock_limit: None,
                memlock_used: 0,
                faults: Vec::new(),
            }),
        }
    }

    /// Kernel whose map allocations are charged against `bytes` of locked memory
    pub fn with_memlock_limit(bytes: u64) -> Self {
        let kernel = Self::new();
        kernel.state.lock().memlock_limit = Some(bytes);
        kernel
    }

    /// Make the next call of `op` fail with `errno`
    pub fn inject_fault(&self, op: SimOp, errno: Errno) {
        self.inject_fault_after(op, 0, errno);
    }

    /// Let `skip` calls of `op` through, then fail the next one with `errno`
    pub fn inject_fault_after(&self, op: SimOp, skip: usize, errno: Errno) {
        self.state.lock().faults.push(Fault { op, skip, errno });
    }

    /// Number of fds currently open in this "process"
    pub fn open_fds(&self) -> usize {
        self.state.lock().fds.len()
    }

    /// Number of maps still held by the kernel
    pub fn live_maps(&self) -> usize {
        self.state.lock().maps.len()
    }

    pub fn map_exists(&self, id: MapId) -> bool {
        self.state.lock().maps.contains_key(&id)
    }

    /// Reference count of a map, if it still exists
    pub fn map_refs(&self, id: MapId) -> Option<usize> {
        self.state.lock().maps.get(&id).map(|m| m.refs)
    }

    pub fn loaded_programs(&self) -> Vec<String> {
        self.state.lock().progs.values().map(|p| p.name.clone()).collect()
    }

    pub fn memlock_used(&self) -> u64 {
        self.state.lock().memlock_used
    }
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn take_fault(&mut self, op: SimOp) -> SysResult<()> {
        let Some(pos) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };
        let fault = &mut self.faults[pos];
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(());
        }
        let errno = fault.errno;
        self.faults.remove(pos);
        trace!(?op, %errno, "injected fault");
        Err(errno)
    }

    /// Lowest free fd, like the kernel's allocator
    fn alloc_fd(&mut self, target: FdTarget) -> SysResult<RawFd> {
        if self.fds.len() >= SIM_MAX_FDS {
            return Err(Errno::EMFILE);
        }
        let mut fd = SIM_FIRST_FD;
        while self.fds.contains_key(&fd) {
            fd += 1;
        }
        self.fds.insert(fd, target);
        Ok(fd)
    }

    fn map_id_for(&self, fd: RawFd) -> SysResult<MapId> {
        match self.fds.get(&fd) {
            Some(FdTarget::Map(id)) => Ok(*id),
            Some(FdTarget::Prog(_)) => Err(Errno::EINVAL),
            None => Err(Errno::EBADF),
        }
    }

    fn map_for(&self, fd: RawFd) -> SysResult<(MapId, &SimMap)> {
        let id = self.map_id_for(fd)?;
        self.maps.get(&id).map(|m| (id, m)).ok_or(Errno::EBADF)
    }

    fn add_map_ref(&mut self, id: MapId) {
        if let Some(map) = self.maps.get_mut(&id) {
            map.refs += 1;
        }
    }

    /// Drop one reference, reclaiming maps (and what they hold) at zero
    fn put_map(&mut self, id: MapId) {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(map) = self.maps.get_mut(&id) else {
                continue;
            };
            map.refs = map.refs.saturating_sub(1);
            if map.refs > 0 {
                continue;
            }
            if let Some(map) = self.maps.remove(&id) {
                self.memlock_used = self.memlock_used.saturating_sub(map.charge);
                debug!(map_id = %id, kind = %map.spec.kind, "map reclaimed");
                if map.inner_template.is_some() {
                    pending.extend(map.entries.values().filter_map(|v| MapId::from_ne_slice(v)));
                }
            }
        }
    }

    fn check_key(map: &SimMap, key: &[u8]) -> SysResult<()> {
        if key.len() != map.spec.key_size as usize {
            return Err(Errno::EINVAL);
        }
        if map.spec.kind.is_array() {
            let index = u32::from_ne_slice(key).ok_or(Errno::EINVAL)?;
            if index >= map.spec.max_entries {
                return Err(Errno::E2BIG);
            }
        }
        Ok(())
    }
}

fn charge_for(spec: &MapSpec) -> u64 {
    let per_entry = u64::from(spec.key_size) + u64::from(spec.value_size);
    per_entry * u64::from(spec.max_entries)
}

impl BpfSyscalls for SimulatedKernel {
    fn platform(&self) -> BpfPlatform {
        BpfPlatform::Simulation
    }

    fn map_create(&self, spec: &MapSpec, inner_map_fd: Option<RawFd>) -> SysResult<RawFd> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::MapCreate)?;

        if spec.key_size == 0 || spec.value_size == 0 || spec.max_entries == 0 {
            return Err(Errno::EINVAL);
        }
        if spec.kind.is_array() && spec.key_size != 4 {
            return Err(Errno::EINVAL);
        }
        if spec.name.as_ref().is_some_and(|n| n.len() >= OBJ_NAME_LEN) {
            return Err(Errno::EINVAL);
        }

        let inner_template = if spec.kind.is_map_of_maps() {
            if spec.value_size != 4 {
                return Err(Errno::EINVAL);
            }
            let inner_fd = inner_map_fd.ok_or(Errno::EBADF)?;
            let (_, inner) = state.map_for(inner_fd)?;
            if inner.spec.kind.is_map_of_maps() {
                return Err(Errno::EINVAL);
            }
            Some(inner.spec.clone())
        } else {
            None
        };

        let charge = charge_for(spec);
        if let Some(limit) = state.memlock_limit {
            if state.memlock_used + charge > limit {
                return Err(Errno::EPERM);
            }
        }

        let id = MapId(state.next_map_id);
        let fd = state.alloc_fd(FdTarget::Map(id))?;
        state.next_map_id += 1;
        state.memlock_used += charge;
        state.maps.insert(
            id,
            SimMap {
                spec: spec.clone(),
                inner_template,
                entries: FastMap::default(),
                refs: 1,
                charge,
            },
        );

        debug!(fd, map_id = %id, kind = %spec.kind, "map created");
        Ok(fd)
    }

    fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: UpdateFlags) -> SysResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::MapUpdate)?;

        let (id, map) = state.map_for(fd)?;
        SimState::check_key(map, key)?;
        if value.len() != map.spec.value_size as usize {
            return Err(Errno::EINVAL);
        }

        let plain_array = map.spec.kind == MapKind::Array;
        let exists = plain_array || map.entries.contains_key(key);
        match flags {
            UpdateFlags::NoExist if exists => return Err(Errno::EEXIST),
            UpdateFlags::Exist if !exists => return Err(Errno::ENOENT),
            _ => {}
        }
        if !exists && map.entries.len() >= map.spec.max_entries as usize {
            return Err(Errno::E2BIG);
        }

        // Map-of-maps slots store the inner map's id, given its fd
        let stored = match &map.inner_template {
            Some(template) => {
                let inner_fd = RawFd::from_ne_slice(value).ok_or(Errno::EINVAL)?;
                let (inner_id, inner) = state.map_for(inner_fd)?;
                if !inner.spec.matches_template(template) {
                    return Err(Errno::EINVAL);
                }
                Some(inner_id)
            }
            None => None,
        };

        let new_value = stored.map_or_else(|| value.to_vec(), |inner_id| inner_id.to_ne_vec());
        if let Some(inner_id) = stored {
            state.add_map_ref(inner_id);
        }

        let previous = state
            .maps
            .get_mut(&id)
            .and_then(|m| m.entries.insert(key.to_vec(), new_value));

        if stored.is_some() {
            if let Some(old_id) = previous.as_deref().and_then(MapId::from_ne_slice) {
                state.put_map(old_id);
            }
        }
        Ok(())
    }

    fn map_lookup(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::MapLookup)?;

        let (_, map) = state.map_for(fd)?;
        SimState::check_key(map, key)?;
        if value.len() != map.spec.value_size as usize {
            return Err(Errno::EINVAL);
        }

        match map.entries.get(key) {
            Some(stored) => value.copy_from_slice(stored),
            None if map.spec.kind == MapKind::Array => value.fill(0),
            None => return Err(Errno::ENOENT),
        }
        Ok(())
    }

    fn map_delete(&self, fd: RawFd, key: &[u8]) -> SysResult<()> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::MapDelete)?;

        let (id, map) = state.map_for(fd)?;
        SimState::check_key(map, key)?;
        if map.spec.kind == MapKind::Array {
            return Err(Errno::EINVAL);
        }
        let of_maps = map.inner_template.is_some();

        let removed = state
            .maps
            .get_mut(&id)
            .and_then(|m| m.entries.remove(key))
            .ok_or(Errno::ENOENT)?;

        if of_maps {
            if let Some(inner_id) = MapId::from_ne_slice(&removed) {
                state.put_map(inner_id);
            }
        }
        Ok(())
    }

    fn map_get_fd_by_id(&self, id: MapId) -> SysResult<RawFd> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::MapGetFdById)?;

        if !state.maps.contains_key(&id) {
            return Err(Errno::ENOENT);
        }
        let fd = state.alloc_fd(FdTarget::Map(id))?;
        state.add_map_ref(id);
        Ok(fd)
    }

    fn map_info(&self, fd: RawFd) -> SysResult<MapInfo> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::MapInfo)?;

        let (id, map) = state.map_for(fd)?;
        Ok(MapInfo {
            id,
            kind: map.spec.kind,
            key_size: map.spec.key_size,
            value_size: map.spec.value_size,
            max_entries: map.spec.max_entries,
            flags: map.spec.flags,
            name: map.spec.name.clone().unwrap_or_default(),
        })
    }

    fn prog_load(&self, program: &ProgramLoad) -> SysResult<RawFd> {
        let mut state = self.state.lock();
        state.take_fault(SimOp::ProgLoad)?;

        if program.insns.is_empty() || program.insns.len() % BPF_INSN_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        if program.license.is_empty() {
            return Err(Errno::EINVAL);
        }

        // Map references must have been patched with live map fds
        for insn in program.insns.chunks_exact(BPF_INSN_SIZE) {
            let is_ld_imm64 = insn[0] == 0x18;
            let src_reg = insn[1] >> 4;
            if is_ld_imm64 && src_reg == 1 {
                let imm = i32::from_ne_slice(&insn[4..8]).ok_or(Errno::EINVAL)?;
                state.map_id_for(imm)?;
            }
        }

        let prog_id = state.next_prog_id;
        let fd = state.alloc_fd(FdTarget::Prog(prog_id))?;
        state.next_prog_id += 1;
        state.progs.insert(
            prog_id,
            SimProg {
                name: program.name.clone(),
                refs: 1,
            },
        );

        debug!(fd, prog_id, name = %program.name, "program loaded");
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> SysResult<()> {
        let mut state = self.state.lock();
        let target = state.fds.remove(&fd).ok_or(Errno::EBADF)?;

        match target {
            FdTarget::Map(id) => state.put_map(id),
            FdTarget::Prog(prog_id) => {
                let unused = state.progs.get_mut(&prog_id).is_some_and(|p| {
                    p.refs = p.refs.saturating_sub(1);
                    p.refs == 0
                });
                if unused {
                    state.progs.remove(&prog_id);
                }
            }
        }

        // Like close(2), the fd is gone even when an error is reported
        state.take_fault(SimOp::Close)
    }
}
