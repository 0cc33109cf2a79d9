//! Ambient configuration surface (SPEC_FULL.md §1.1).
//!
//! The core never parses argv or a config file; it only consumes a
//! `SimulatorConfig` assembled by the embedding scheduler. Grounded in the
//! teacher's `Flags` (examples/isgasho-rd/src/flags.rs): a plain struct
//! behind a single accessor, constructed once at startup, rather than
//! scattered global constants.

use serde::{Deserialize, Serialize};

/// Tunables the spec requires an explicit policy for instead of a guess.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// TSC rate used by the C1 emulator. Never measured by this crate;
    /// the embedder seeds it from `CPUID` leaf 0x15/0x16 or a fixed value.
    pub cycles_per_second: u64,

    /// How far simulated time may run ahead of the scheduler's global
    /// horizon before a would-be `Done` must instead become a `Block`
    /// (SPEC_FULL.md §4.6, unblocked-CPU-latency model).
    pub runahead_window_ns: u64,

    /// Synthetic per-syscall CPU cost, accumulated until it exceeds
    /// `unblocked_latency_cap_ns`.
    pub unblocked_syscall_latency_ns: u64,

    /// Cap on the accumulated unblocked-syscall latency counter before it
    /// must be applied to simulated time (possibly converting a `Done`
    /// into a `Block`).
    pub unblocked_latency_cap_ns: u64,

    /// Interval between C7 heartbeat rollups.
    pub heartbeat_interval_ns: u64,

    /// Resolves the SPEC_FULL.md §9 Open Question: whether a traced
    /// SIGSTOP is forwarded into the guest's signal state or swallowed by
    /// the tracer. Default `false` (swallow): SIGSTOP is treated as a
    /// tracer synchronization signal only.
    pub forward_sigstop_to_guest: bool,

    /// This host's configured name, used by `shadow_hostname_to_addr_ipv4`
    /// to resolve self-hostname lookups without a DNS round trip.
    pub host_name: String,

    /// This host's default IPv4 address (network byte order), returned
    /// when a guest resolves its own `host_name`.
    pub host_default_addr: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            cycles_per_second: 2_000_000_000,
            runahead_window_ns: 10_000_000,
            unblocked_syscall_latency_ns: 1_000,
            unblocked_latency_cap_ns: 1_000_000,
            heartbeat_interval_ns: 10_000_000_000,
            forward_sigstop_to_guest: false,
            host_name: String::from("host"),
            host_default_addr: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = SimulatorConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SimulatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cycles_per_second, cfg.cycles_per_second);
        assert_eq!(back.forward_sigstop_to_guest, cfg.forward_sigstop_to_guest);
    }
}
