//! trialgrid-metrics: hardware probes and binary metric rows.
//!
//! # Architecture
//!
//! ```text
//!   sysinfo ──► SysinfoProbe ──► HardwareInformation / HardwareStats ──► node heartbeat
//!   nvidia-smi ──► GpuReader ──► GpuInfo ─┘
//!   container stats ──► CpuUsageTracker ──► HardwareSample ──► hardware row (LE bytes)
//! ```
//!
//! Rows are little-endian and versioned by their first byte so readers
//! can evolve independently.

pub mod cpu;
pub mod gpu;
pub mod host;
pub mod rows;

pub use cpu::CpuUsageTracker;
pub use gpu::{GpuInfo, GpuReader, NvidiaVersions, parse_gpu_query};
pub use host::{HardwareInformation, HardwareStats, HostFacts, HostProbe, SysinfoProbe};
pub use rows::{GpuSample, HardwareSample, RowWriter, encode_channel_row, encode_hardware_row, encode_speed_row, scale_ratio};
