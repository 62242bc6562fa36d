/*!
 * Linux eBPF Backend
 * Direct `bpf(2)` syscalls through libc
 */

use super::traits::BpfSyscalls;
use super::types::{BpfPlatform, ProgramLoad};
use crate::core::limits::{BPF_INSN_SIZE, OBJ_NAME_LEN};
use crate::core::types::{MapId, MapInfo, MapKind, MapSpec, SysResult, UpdateFlags};
use nix::errno::Errno;
use nix::libc;
use std::ffi::CString;
use std::os::fd::RawFd;
use tracing::{info, warn};

const BPF_MAP_CREATE: u32 = 0;
const BPF_MAP_LOOKUP_ELEM: u32 = 1;
const BPF_MAP_UPDATE_ELEM: u32 = 2;
const BPF_MAP_DELETE_ELEM: u32 = 3;
const BPF_PROG_LOAD: u32 = 5;
const BPF_MAP_GET_FD_BY_ID: u32 = 14;
const BPF_OBJ_GET_INFO_BY_FD: u32 = 15;

#[repr(C)]
#[derive(Debug, Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; OBJ_NAME_LEN],
    map_ifindex: u32,
    btf_fd: u32,
    btf_key_type_id: u32,
    btf_value_type_id: u32,
    btf_vmlinux_value_type_id: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct GetFdByIdAttr {
    id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct InfoByFdAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

/// Leading part of `struct bpf_map_info`
#[repr(C)]
#[derive(Debug, Default)]
struct RawMapInfo {
    map_type: u32,
    id: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    name: [u8; OBJ_NAME_LEN],
}

#[repr(C)]
#[derive(Debug, Default)]
struct ProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
    prog_name: [u8; OBJ_NAME_LEN],
    prog_ifindex: u32,
    expected_attach_type: u32,
}

fn sys_bpf<T>(cmd: u32, attr: &mut T) -> SysResult<libc::c_long> {
    // SAFETY: `attr` is a live, properly sized repr(C) bpf_attr prefix and the
    // kernel reads/writes at most `size_of::<T>()` bytes of it
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_int,
            attr as *mut T,
            std::mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

fn object_name(name: &str) -> [u8; OBJ_NAME_LEN] {
    let mut out = [0u8; OBJ_NAME_LEN];
    let len = name.len().min(OBJ_NAME_LEN - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

fn raw_fd(fd: RawFd) -> SysResult<u32> {
    u32::try_from(fd).map_err(|_| Errno::EBADF)
}

/// Linux backend issuing real `bpf(2)` calls
#[derive(Debug, Clone, Default)]
pub struct LinuxBpf {
    /// Verifier log buffer size; 0 disables the log
    verifier_log_size: u32,
}

impl LinuxBpf {
    pub fn new() -> Self {
        if Self::check_support() {
            info!("Linux bpf backend initialized");
        } else {
            warn!("bpf filesystem not mounted; kernel calls may be rejected");
        }
        Self::default()
    }

    /// Capture the verifier log of failed program loads
    pub fn with_verifier_log(mut self, size: u32) -> Self {
        self.verifier_log_size = size;
        self
    }

    /// Simple check: see if /sys/fs/bpf exists
    pub fn check_support() -> bool {
        std::fs::metadata("/sys/fs/bpf").is_ok()
    }

    fn elem_attr(fd: RawFd, key: &[u8], value: *const u8, flags: u64) -> SysResult<MapElemAttr> {
        Ok(MapElemAttr {
            map_fd: raw_fd(fd)?,
            _pad: 0,
            key: key.as_ptr() as u64,
            value: value as u64,
            flags,
        })
    }

    fn as_fd(ret: libc::c_long) -> SysResult<RawFd> {
        RawFd::try_from(ret).map_err(|_| Errno::EOVERFLOW)
    }
}

impl BpfSyscalls for LinuxBpf {
    fn platform(&self) -> BpfPlatform {
        BpfPlatform::Linux
    }

    fn map_create(&self, spec: &MapSpec, inner_map_fd: Option<RawFd>) -> SysResult<RawFd> {
        let mut attr = MapCreateAttr {
            map_type: spec.kind.as_raw(),
            key_size: spec.key_size,
            value_size: spec.value_size,
            max_entries: spec.max_entries,
            map_flags: spec.flags,
            inner_map_fd: inner_map_fd.map(raw_fd).transpose()?.unwrap_or(0),
            map_name: object_name(spec.name.as_deref().unwrap_or_default()),
            ..Default::default()
        };
        Self::as_fd(sys_bpf(BPF_MAP_CREATE, &mut attr)?)
    }

    fn map_update(&self, fd: RawFd, key: &[u8], value: &[u8], flags: UpdateFlags) -> SysResult<()> {
        let mut attr = Self::elem_attr(fd, key, value.as_ptr(), flags.as_raw())?;
        sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr).map(drop)
    }

    fn map_lookup(&self, fd: RawFd, key: &[u8], value: &mut [u8]) -> SysResult<()> {
        let mut attr = Self::elem_attr(fd, key, value.as_mut_ptr(), 0)?;
        sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr).map(drop)
    }

    fn map_delete(&self, fd: RawFd, key: &[u8]) -> SysResult<()> {
        let mut attr = Self::elem_attr(fd, key, std::ptr::null(), 0)?;
        sys_bpf(BPF_MAP_DELETE_ELEM, &mut attr).map(drop)
    }

    fn map_get_fd_by_id(&self, id: MapId) -> SysResult<RawFd> {
        let mut attr = GetFdByIdAttr {
            id: id.as_u32(),
            ..Default::default()
        };
        Self::as_fd(sys_bpf(BPF_MAP_GET_FD_BY_ID, &mut attr)?)
    }

    fn map_info(&self, fd: RawFd) -> SysResult<MapInfo> {
        let mut info = RawMapInfo::default();
        let mut attr = InfoByFdAttr {
            bpf_fd: raw_fd(fd)?,
            info_len: std::mem::size_of::<RawMapInfo>() as u32,
            info: &mut info as *mut RawMapInfo as u64,
        };
        sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;

        let name_len = info.name.iter().position(|&b| b == 0).unwrap_or(OBJ_NAME_LEN);
        Ok(MapInfo {
            id: MapId(info.id),
            kind: MapKind::from_raw(info.map_type).ok_or(Errno::EOPNOTSUPP)?,
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            flags: info.map_flags,
            name: String::from_utf8_lossy(&info.name[..name_len]).into_owned(),
        })
    }

    fn prog_load(&self, program: &ProgramLoad) -> SysResult<RawFd> {
        let license = CString::new(program.license.as_str()).map_err(|_| Errno::EINVAL)?;
        let mut log = vec![0u8; self.verifier_log_size as usize];

        let mut attr = ProgLoadAttr {
            prog_type: program.prog_type.as_raw(),
            insn_cnt: (program.insns.len() / BPF_INSN_SIZE) as u32,
            insns: program.insns.as_ptr() as u64,
            license: license.as_ptr() as u64,
            kern_version: program.kern_version,
            prog_name: object_name(&program.name),
            expected_attach_type: program.expected_attach_type.map_or(0, |a| a.as_raw()),
            ..Default::default()
        };
        if !log.is_empty() {
            attr.log_level = 1;
            attr.log_size = self.verifier_log_size;
            attr.log_buf = log.as_mut_ptr() as u64;
        }

        let result = sys_bpf(BPF_PROG_LOAD, &mut attr);
        if let Err(errno) = result {
            let end = log.iter().position(|&b| b == 0).unwrap_or(log.len());
            if end > 0 {
                warn!(
                    program = %program.name,
                    %errno,
                    verifier_log = %String::from_utf8_lossy(&log[..end]),
                    "program rejected by verifier"
                );
            }
        }
        Self::as_fd(result?)
    }

    fn close(&self, fd: RawFd) -> SysResult<()> {
        nix::unistd::close(fd)
    }
}
