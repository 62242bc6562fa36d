/*!
 * Limits and Constants
 *
 * Map geometry, workload values and kernel ABI numbers in one place.
 */

// =============================================================================
// MAP GEOMETRY
// =============================================================================

/// Default name of the table-of-tables declared in the object
pub const DEFAULT_OUTER_MAP_NAME: &str = "outer_map";

/// Capacity of the outer map as declared in the object
pub const OUTER_MAP_MAX_ENTRIES: u32 = 128;

/// Capacity of the transient inner template
pub const TEMPLATE_MAX_ENTRIES: u32 = 8;

/// Capacity of each runtime inner map
pub const INNER_MAP_MAX_ENTRIES: u32 = 8;

/// Name given to runtime inner maps
pub const INNER_MAP_NAME: &str = "inner_map";

/// Kernel limit on map and program names, including the trailing NUL
/// [LINUX-COMPAT] BPF_OBJ_NAME_LEN
pub const OBJ_NAME_LEN: usize = 16;

// =============================================================================
// WORKLOAD
// =============================================================================

/// Default compiled object path, relative to the working directory
pub const DEFAULT_OBJECT_PATH: &str = "./test_bpf.o";

pub const DEFAULT_OUTER_KEY: u32 = 42;
pub const DEFAULT_INNER_KEY: u32 = 12;
pub const DEFAULT_INNER_VALUE: u32 = 34;

// =============================================================================
// OBJECT FORMAT
// =============================================================================

/// Size of a legacy `struct bpf_map_def` (type, key, value, max_entries, flags)
pub const LEGACY_MAP_DEF_SIZE: usize = 20;

/// Size of one BPF instruction
pub const BPF_INSN_SIZE: usize = 8;

/// ELF machine number for BPF
pub const EM_BPF: u16 = 247;

// =============================================================================
// SIMULATION
// =============================================================================

/// First fd handed out by the simulated kernel (0-2 are stdio)
pub const SIM_FIRST_FD: i32 = 3;

/// Highest fd the simulated kernel hands out before reporting EMFILE
pub const SIM_MAX_FDS: usize = 1024;
