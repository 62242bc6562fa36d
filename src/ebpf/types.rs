/*!
 * eBPF Types
 * Program types, attach types and object declarations
 */

use crate::core::types::MapSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend types for kernel access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BpfPlatform {
    /// Real `bpf(2)` syscalls
    #[default]
    Linux,
    /// In-memory kernel for tests and unsupported platforms
    Simulation,
}

impl fmt::Display for BpfPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BpfPlatform::Linux => f.write_str("linux"),
            BpfPlatform::Simulation => f.write_str("simulation"),
        }
    }
}

/// eBPF program type (`BPF_PROG_TYPE_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramType {
    SocketFilter,
    Kprobe,
    SchedCls,
    SchedAct,
    Tracepoint,
    Xdp,
    PerfEvent,
    CgroupSkb,
    CgroupSock,
    LwtIn,
    LwtOut,
    LwtXmit,
    SockOps,
    SkSkb,
    CgroupDevice,
    SkMsg,
    RawTracepoint,
    Lsm,
}

impl ProgramType {
    pub const fn as_raw(self) -> u32 {
        match self {
            ProgramType::SocketFilter => 1,
            ProgramType::Kprobe => 2,
            ProgramType::SchedCls => 3,
            ProgramType::SchedAct => 4,
            ProgramType::Tracepoint => 5,
            ProgramType::Xdp => 6,
            ProgramType::PerfEvent => 7,
            ProgramType::CgroupSkb => 8,
            ProgramType::CgroupSock => 9,
            ProgramType::LwtIn => 10,
            ProgramType::LwtOut => 11,
            ProgramType::LwtXmit => 12,
            ProgramType::SockOps => 13,
            ProgramType::SkSkb => 14,
            ProgramType::CgroupDevice => 15,
            ProgramType::SkMsg => 16,
            ProgramType::RawTracepoint => 17,
            ProgramType::Lsm => 29,
        }
    }
}

/// Expected attach type (`BPF_*` attach enum), only where a section implies one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachType {
    CgroupInetIngress,
    CgroupInetEgress,
    CgroupInetSockCreate,
    CgroupSockOps,
    SkSkbStreamParser,
    SkSkbStreamVerdict,
    CgroupDevice,
    SkMsgVerdict,
    LsmMac,
}

impl AttachType {
    pub const fn as_raw(self) -> u32 {
        match self {
            AttachType::CgroupInetIngress => 0,
            AttachType::CgroupInetEgress => 1,
            AttachType::CgroupInetSockCreate => 2,
            AttachType::CgroupSockOps => 3,
            AttachType::SkSkbStreamParser => 4,
            AttachType::SkSkbStreamVerdict => 5,
            AttachType::CgroupDevice => 6,
            AttachType::SkMsgVerdict => 7,
            AttachType::LsmMac => 27,
        }
    }
}

/// Section-name prefix table, longest prefixes first where they overlap
const SECTION_TYPES: &[(&str, ProgramType, Option<AttachType>)] = &[
    ("socket", ProgramType::SocketFilter, None),
    ("kretprobe/", ProgramType::Kprobe, None),
    ("kprobe/", ProgramType::Kprobe, None),
    ("uretprobe/", ProgramType::Kprobe, None),
    ("uprobe/", ProgramType::Kprobe, None),
    ("classifier", ProgramType::SchedCls, None),
    ("tc", ProgramType::SchedCls, None),
    ("action", ProgramType::SchedAct, None),
    ("raw_tracepoint/", ProgramType::RawTracepoint, None),
    ("raw_tp/", ProgramType::RawTracepoint, None),
    ("tracepoint/", ProgramType::Tracepoint, None),
    ("tp/", ProgramType::Tracepoint, None),
    ("xdp", ProgramType::Xdp, None),
    ("perf_event", ProgramType::PerfEvent, None),
    ("lwt_in", ProgramType::LwtIn, None),
    ("lwt_out", ProgramType::LwtOut, None),
    ("lwt_xmit", ProgramType::LwtXmit, None),
    ("cgroup_skb/ingress", ProgramType::CgroupSkb, Some(AttachType::CgroupInetIngress)),
    ("cgroup_skb/egress", ProgramType::CgroupSkb, Some(AttachType::CgroupInetEgress)),
    ("cgroup/skb", ProgramType::CgroupSkb, None),
    ("cgroup/sock", ProgramType::CgroupSock, Some(AttachType::CgroupInetSockCreate)),
    ("cgroup/dev", ProgramType::CgroupDevice, Some(AttachType::CgroupDevice)),
    ("sockops", ProgramType::SockOps, Some(AttachType::CgroupSockOps)),
    ("sk_skb/stream_parser", ProgramType::SkSkb, Some(AttachType::SkSkbStreamParser)),
    ("sk_skb/stream_verdict", ProgramType::SkSkb, Some(AttachType::SkSkbStreamVerdict)),
    ("sk_skb", ProgramType::SkSkb, None),
    ("sk_msg", ProgramType::SkMsg, Some(AttachType::SkMsgVerdict)),
    ("lsm/", ProgramType::Lsm, Some(AttachType::LsmMac)),
];

/// Guess program and attach type from an ELF section name
pub fn program_type_by_section(section: &str) -> Option<(ProgramType, Option<AttachType>)> {
    SECTION_TYPES
        .iter()
        .find(|(prefix, _, _)| section.starts_with(prefix))
        .map(|&(_, prog_type, attach)| (prog_type, attach))
}

/// Map declared in an object file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapDef {
    pub name: String,
    pub spec: MapSpec,
}

/// Map reference inside a program that must be patched with a map fd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRelocation {
    /// Instruction index of the `ld_imm64`
    pub insn_index: usize,
    /// Index into the object's map list
    pub map_index: usize,
}

/// Program declared in an object file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDef {
    /// Function symbol name
    pub name: String,
    /// Section title, e.g. `classifier/test_func`
    pub section: String,
    /// Raw instructions
    pub insns: Vec<u8>,
    pub relocations: Vec<MapRelocation>,
    pub prog_type: Option<ProgramType>,
    pub expected_attach_type: Option<AttachType>,
}

impl ProgramDef {
    pub fn new(name: impl Into<String>, section: impl Into<String>, insns: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            section: section.into(),
            insns,
            relocations: Vec::new(),
            prog_type: None,
            expected_attach_type: None,
        }
    }
}

/// Program load request handed to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramLoad {
    pub name: String,
    pub prog_type: ProgramType,
    pub expected_attach_type: Option<AttachType>,
    pub insns: Vec<u8>,
    pub license: String,
    pub kern_version: u32,
}

/// Lifecycle of an extension object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Opened,
    Loaded,
    Unloaded,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectState::Opened => f.write_str("opened"),
            ObjectState::Loaded => f.write_str("loaded"),
            ObjectState::Unloaded => f.write_str("unloaded"),
        }
    }
}
