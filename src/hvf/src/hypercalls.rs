pub const PSCI_VERSION: u32 = 0x8400_0000;
pub const PSCI_MIGRATE_INFO_TYPE: u32 = 0x8400_0006;
pub const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u32 = 0x8400_0009;
pub const PSCI_CPU_OFF: u32 = 0x8400_0002;
pub const PSCI_CPU_ON: u32 = 0xc400_0003;
pub const PSCI_CPU_SUSPEND: u32 = 0xc400_0001;
pub const PSCI_AFFINITY_INFO: u32 = 0xc400_0004;
pub const PSCI_FEATURES: u32 = 0x8400_000a;

pub const PSCI_VERSION_1_1: u64 = (1 << 16) | 1;

pub const PSCI_SUCCESS: i64 = 0;
pub const PSCI_NOT_SUPPORTED: i64 = -1;
pub const PSCI_DISABLED: i64 = -8;
