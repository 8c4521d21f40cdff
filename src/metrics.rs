use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;

/// `opentelemetry` instrument handles shared by [`crate::manager::Manager`] and everything it
/// owns.
///
/// Instruments are constructed once in [`Metrics::new`] and cloned into every component that
/// needs them, the same pattern `bufferpool::BufferPool` uses for its buffer-count
/// `UpDownCounter`: the handles are cheap, `Arc`-backed, and safe to share across tasks.
#[derive(Clone)]
pub struct Metrics {
    unknown_tcp: Counter<u64>,
    unknown_udp: Counter<u64>,
    stream_channel_depth: UpDownCounter<i64>,
    packet_channel_depth: UpDownCounter<i64>,
    write_request_depth: UpDownCounter<i64>,
    udp_write_duration: Histogram<f64>,
    limiter_active_connections: UpDownCounter<i64>,
    limiter_wait_duration: Histogram<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("bindtodevice_dispatch");

        Self {
            unknown_tcp: meter
                .u64_counter("dispatch.unknown_destination")
                .with_description("TCP connections whose original destination matched no registered subnet.")
                .with_unit("{connections}")
                .init(),
            unknown_udp: meter
                .u64_counter("dispatch.unknown_destination")
                .with_description("UDP datagrams whose original destination matched no registered subnet.")
                .with_unit("{datagrams}")
                .init(),
            stream_channel_depth: meter
                .i64_up_down_counter("dispatch.stream_channel.depth")
                .with_description("Number of accepted TCP connections queued for a virtual listener.")
                .with_unit("{connections}")
                .init(),
            packet_channel_depth: meter
                .i64_up_down_counter("dispatch.packet_channel.depth")
                .with_description("Number of datagram sessions queued for a virtual packet connection.")
                .with_unit("{datagrams}")
                .init(),
            write_request_depth: meter
                .i64_up_down_counter("dispatch.write_request_channel.depth")
                .with_description("Number of pending UDP write requests queued for an interface's write task.")
                .with_unit("{writes}")
                .init(),
            udp_write_duration: meter
                .f64_histogram("dispatch.udp.write_duration")
                .with_description("Time spent performing a single UDP write-back syscall.")
                .with_unit("s")
                .init(),
            limiter_active_connections: meter
                .i64_up_down_counter("dispatch.conn_limiter.active_connections")
                .with_description("Connections currently admitted by a connection limiter.")
                .with_unit("{connections}")
                .init(),
            limiter_wait_duration: meter
                .f64_histogram("dispatch.conn_limiter.wait_duration")
                .with_description("Time a caller spent blocked in ConnLimiter::accept waiting for admission.")
                .with_unit("s")
                .init(),
        }
    }

    pub fn record_unknown_tcp(&self, iface: &str) {
        self.unknown_tcp.add(1, &[KeyValue::new("iface", iface.to_string())]);
    }

    pub fn record_unknown_udp(&self, iface: &str) {
        self.unknown_udp.add(1, &[KeyValue::new("iface", iface.to_string())]);
    }

    pub fn stream_channel_depth_inc(&self, subnet: &str) {
        self.stream_channel_depth.add(1, &[KeyValue::new("subnet", subnet.to_string())]);
    }

    pub fn stream_channel_depth_dec(&self, subnet: &str) {
        self.stream_channel_depth.add(-1, &[KeyValue::new("subnet", subnet.to_string())]);
    }

    pub fn packet_channel_depth_inc(&self, subnet: &str) {
        self.packet_channel_depth.add(1, &[KeyValue::new("subnet", subnet.to_string())]);
    }

    pub fn packet_channel_depth_dec(&self, subnet: &str) {
        self.packet_channel_depth.add(-1, &[KeyValue::new("subnet", subnet.to_string())]);
    }

    pub fn write_request_depth_inc(&self, iface: &str) {
        self.write_request_depth.add(1, &[KeyValue::new("iface", iface.to_string())]);
    }

    pub fn write_request_depth_dec(&self, iface: &str) {
        self.write_request_depth.add(-1, &[KeyValue::new("iface", iface.to_string())]);
    }

    pub fn record_udp_write_duration(&self, iface: &str, duration: Duration) {
        self.udp_write_duration
            .record(duration.as_secs_f64(), &[KeyValue::new("iface", iface.to_string())]);
    }

    pub fn limiter_active_connections_inc(&self, id: &str) {
        self.limiter_active_connections.add(1, &[KeyValue::new("listener", id.to_string())]);
    }

    pub fn limiter_active_connections_dec(&self, id: &str) {
        self.limiter_active_connections.add(-1, &[KeyValue::new("listener", id.to_string())]);
    }

    pub fn record_limiter_wait_duration(&self, id: &str, duration: Duration) {
        self.limiter_wait_duration
            .record(duration.as_secs_f64(), &[KeyValue::new("listener", id.to_string())]);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
