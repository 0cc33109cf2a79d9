//! Per-Host Statistics Tracker (C7): heartbeat CSV rollups for NODE,
//! SOCKET, and RAM categories, at the exact formats in SPEC_FULL.md §6.

use std::collections::HashMap;

/// Bytes/packets split by control vs payload vs retransmit, per §3.
#[derive(Copy, Clone, Default, Debug)]
pub struct CounterBucket {
    pub control_header_bytes: u64,
    pub payload_header_bytes: u64,
    pub payload_bytes: u64,
    pub retrans_header_bytes: u64,
    pub retrans_payload_bytes: u64,
    pub control_packets: u64,
    pub payload_packets: u64,
    pub retrans_packets: u64,
}

impl CounterBucket {
    /// Record one packet. Per §4.7: packets are `payload` when their
    /// length is nonzero, else `control`; retransmits are a disjoint
    /// sub-count layered on top.
    pub fn record_packet(&mut self, payload_len: u64, header_bytes: u64, is_retransmit: bool) {
        if is_retransmit {
            self.retrans_packets += 1;
            self.retrans_header_bytes += header_bytes;
            self.retrans_payload_bytes += payload_len;
            return;
        }
        if payload_len > 0 {
            self.payload_packets += 1;
            self.payload_header_bytes += header_bytes;
            self.payload_bytes += payload_len;
        } else {
            self.control_packets += 1;
            self.control_header_bytes += header_bytes;
        }
    }

    fn total_packets(&self) -> u64 {
        self.control_packets + self.payload_packets + self.retrans_packets
    }

    fn total_bytes(&self) -> u64 {
        self.payload_bytes
            + self.payload_header_bytes
            + self.control_header_bytes
            + self.retrans_header_bytes
            + self.retrans_payload_bytes
    }

    fn reset(&mut self) {
        *self = CounterBucket::default();
    }

    /// `total-pkts, total-bytes, payload-bytes, header-bytes, payload-pkts,
    /// payload-header-bytes, control-pkts, control-header-bytes,
    /// retrans-pkts, retrans-header-bytes, retrans-payload-bytes`
    fn format(&self) -> String {
        let header_bytes = self.payload_header_bytes + self.control_header_bytes;
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.total_packets(),
            self.total_bytes(),
            self.payload_bytes,
            header_bytes,
            self.payload_packets,
            self.payload_header_bytes,
            self.control_packets,
            self.control_header_bytes,
            self.retrans_packets,
            self.retrans_header_bytes,
            self.retrans_payload_bytes,
        )
    }
}

#[derive(Default)]
struct NodeCounters {
    local_in: CounterBucket,
    local_out: CounterBucket,
    remote_in: CounterBucket,
    remote_out: CounterBucket,
    recv_bytes: u64,
    send_bytes: u64,
    delayed_count: u64,
    delay_sum_ms: u64,
}

impl NodeCounters {
    fn reset_interval(&mut self) {
        self.local_in.reset();
        self.local_out.reset();
        self.remote_in.reset();
        self.remote_out.reset();
        self.recv_bytes = 0;
        self.send_bytes = 0;
        self.delayed_count = 0;
        self.delay_sum_ms = 0;
    }
}

/// Per §3's Socket Stats Row.
pub struct SocketStatsRow {
    pub handle: i32,
    pub protocol: String,
    pub peer_host_port: String,
    pub inbuf_len: u64,
    pub inbuf_size: u64,
    pub outbuf_len: u64,
    pub outbuf_size: u64,
    pub recv_bytes: u64,
    pub send_bytes: u64,
    pub remove_after_next_log: bool,
}

impl SocketStatsRow {
    fn format(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.handle,
            self.protocol,
            self.peer_host_port,
            self.inbuf_len,
            self.inbuf_size,
            self.outbuf_len,
            self.outbuf_size,
            self.recv_bytes,
            self.send_bytes
        )
    }
}

#[derive(Default)]
struct RamCounters {
    allocated: HashMap<u64, u64>,
    alloc_bytes_interval: u64,
    dealloc_bytes_interval: u64,
    failed_frees: u64,
}

impl RamCounters {
    fn add_allocated(&mut self, id: u64, bytes: u64) {
        self.allocated.insert(id, bytes);
        self.alloc_bytes_interval += bytes;
    }

    fn remove_allocated(&mut self, id: u64) {
        match self.allocated.remove(&id) {
            Some(bytes) => self.dealloc_bytes_interval += bytes,
            None => self.failed_frees += 1,
        }
    }

    fn total_bytes(&self) -> u64 {
        self.allocated.values().sum()
    }

    fn reset_interval(&mut self) {
        self.alloc_bytes_interval = 0;
        self.dealloc_bytes_interval = 0;
        self.failed_frees = 0;
    }
}

bitflags::bitflags! {
    pub struct StatCategories: u32 {
        const NODE = 0b001;
        const SOCKET = 0b010;
        const RAM = 0b100;
    }
}

/// Periodic heartbeat rollup for one host. `heartbeat()` emits a line per
/// enabled category, resets interval counters, drops sockets flagged for
/// removal, and reports the interval so the caller can reschedule itself.
pub struct HostStatsTracker {
    categories: StatCategories,
    interval_ns: u64,
    node: NodeCounters,
    sockets: Vec<SocketStatsRow>,
    ram: RamCounters,
}

impl HostStatsTracker {
    pub fn new(categories: StatCategories, interval_ns: u64) -> HostStatsTracker {
        HostStatsTracker {
            categories,
            interval_ns,
            node: NodeCounters::default(),
            sockets: Vec::new(),
            ram: RamCounters::default(),
        }
    }

    pub fn record_node_packet(&mut self, local: bool, inbound: bool, payload_len: u64, header_bytes: u64, retransmit: bool) {
        let bucket = match (local, inbound) {
            (true, true) => &mut self.node.local_in,
            (true, false) => &mut self.node.local_out,
            (false, true) => &mut self.node.remote_in,
            (false, false) => &mut self.node.remote_out,
        };
        bucket.record_packet(payload_len, header_bytes, retransmit);
        if inbound {
            self.node.recv_bytes += payload_len + header_bytes;
        } else {
            self.node.send_bytes += payload_len + header_bytes;
        }
    }

    pub fn record_delay(&mut self, delay_ms: u64) {
        self.node.delayed_count += 1;
        self.node.delay_sum_ms += delay_ms;
    }

    pub fn add_socket_row(&mut self, row: SocketStatsRow) {
        self.sockets.push(row);
    }

    pub fn mark_socket_for_removal(&mut self, handle: i32) {
        if let Some(row) = self.sockets.iter_mut().find(|r| r.handle == handle) {
            row.remove_after_next_log = true;
        }
    }

    pub fn add_allocated(&mut self, id: u64, bytes: u64) {
        self.ram.add_allocated(id, bytes);
    }

    pub fn remove_allocated(&mut self, id: u64) {
        self.ram.remove_allocated(id);
    }

    fn interval_seconds(&self) -> u64 {
        self.interval_ns / 1_000_000_000
    }

    fn format_node(&self) -> String {
        let interval_s = self.interval_seconds();
        let avg_delay_ms = if self.node.delayed_count > 0 {
            self.node.delay_sum_ms / self.node.delayed_count
        } else {
            0
        };
        format!(
            "[node] {},{},{},{},{},{}; {};{};{};{}",
            interval_s,
            self.node.recv_bytes,
            self.node.send_bytes,
            0, // cpu-percent: not tracked by this core; embedder fills in.
            self.node.delayed_count,
            avg_delay_ms,
            self.node.local_in.format(),
            self.node.local_out.format(),
            self.node.remote_in.format(),
            self.node.remote_out.format(),
        )
    }

    fn format_sockets(&self) -> Vec<String> {
        self.sockets.iter().map(|r| format!("[socket] {}", r.format())).collect()
    }

    fn format_ram(&self) -> String {
        format!(
            "[ram] {},{},{},{},{},{}",
            self.interval_seconds(),
            self.ram.alloc_bytes_interval,
            self.ram.dealloc_bytes_interval,
            self.ram.total_bytes(),
            self.ram.allocated.len(),
            self.ram.failed_frees,
        )
    }

    /// Emit this interval's lines, reset counters, drop removed sockets,
    /// and return the lines in category order (NODE, SOCKET, RAM).
    pub fn heartbeat(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.categories.contains(StatCategories::NODE) {
            lines.push(self.format_node());
        }
        if self.categories.contains(StatCategories::SOCKET) {
            lines.extend(self.format_sockets());
        }
        if self.categories.contains(StatCategories::RAM) {
            lines.push(self.format_ram());
        }

        self.node.reset_interval();
        self.ram.reset_interval();
        self.sockets.retain(|r| !r.remove_after_next_log);

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_heartbeat_matches_scenario() {
        // SPEC_FULL.md §8 scenario 6.
        let mut tracker = HostStatsTracker::new(StatCategories::RAM, 10_000_000_000);
        tracker.add_allocated(0xA, 100);
        tracker.add_allocated(0xB, 50);
        tracker.remove_allocated(0xA);
        let lines = tracker.heartbeat();
        assert_eq!(lines, vec!["[ram] 10,150,100,50,1,0"]);
    }

    #[test]
    fn failed_free_increments_counter() {
        let mut tracker = HostStatsTracker::new(StatCategories::RAM, 1_000_000_000);
        tracker.remove_allocated(0xDEAD);
        let lines = tracker.heartbeat();
        assert_eq!(lines, vec!["[ram] 1,0,0,0,0,1"]);
    }

    #[test]
    fn packet_classification_payload_vs_control() {
        let mut bucket = CounterBucket::default();
        bucket.record_packet(100, 20, false);
        bucket.record_packet(0, 20, false);
        assert_eq!(bucket.payload_packets, 1);
        assert_eq!(bucket.control_packets, 1);
    }

    #[test]
    fn retransmit_is_disjoint_subcount() {
        let mut bucket = CounterBucket::default();
        bucket.record_packet(100, 20, true);
        assert_eq!(bucket.retrans_packets, 1);
        assert_eq!(bucket.payload_packets, 0);
    }

    #[test]
    fn socket_removed_after_next_log_only() {
        let mut tracker = HostStatsTracker::new(StatCategories::SOCKET, 1_000_000_000);
        tracker.add_socket_row(SocketStatsRow {
            handle: 5,
            protocol: "tcp".into(),
            peer_host_port: "10.0.0.1:80".into(),
            inbuf_len: 0,
            inbuf_size: 1024,
            outbuf_len: 0,
            outbuf_size: 1024,
            recv_bytes: 0,
            send_bytes: 0,
            remove_after_next_log: false,
        });
        tracker.mark_socket_for_removal(5);
        let lines = tracker.heartbeat();
        assert_eq!(lines.len(), 1);
        assert!(tracker.heartbeat().is_empty());
    }

    #[test]
    fn node_heartbeat_resets_interval_counters() {
        let mut tracker = HostStatsTracker::new(StatCategories::NODE, 10_000_000_000);
        tracker.record_node_packet(false, true, 100, 20, false);
        let first = tracker.heartbeat();
        assert!(first[0].starts_with("[node] 10,120,0"));
        let second = tracker.heartbeat();
        assert!(second[0].starts_with("[node] 10,0,0"));
    }
}
