use std::time::Duration;
use anyhow::bail;
use tracing::debug;

use crate::engine::{ReliableEngine, MAX_MTU, MIN_MTU};
use crate::error::EngineError;

/// Tuning values for the reliable-transport engine. A copy is applied to every session created
///  after the configuration was set - changing it has no effect on existing sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// 'nodelay' mode: lower minimum RTO and gentler RTO backoff, trading bandwidth for latency
    pub nodelay: bool,
    /// granularity of the engine's internal clock in milliseconds, clamped to 10..=5000 by the
    ///  engine
    pub interval: u32,
    /// number of skipped ACKs that triggers a fast retransmit, 0 disables fast retransmit.
    ///  Typical values are 0, 1 or 2.
    pub fast_retransmit: u32,
    pub congestion_control_off: bool,
    /// maximum number of segments in flight (not bytes)
    pub send_window: u16,
    /// maximum number of segments buffered on the receiving side (not bytes). The engine does not
    ///  go below 128.
    pub recv_window: u16,
    /// This is the size of a datagram emitted by the engine, including the 24 byte segment header.
    ///  It must fit into a single UDP payload on every route, i.e. 1472 for IPV4 with full
    ///  Ethernet frames and no optional headers - 1400 leaves some headroom for tunnels.
    pub mtu: usize,
    /// floor for the retransmission timeout in milliseconds; `None` keeps the engine's default
    ///  (30 in nodelay mode, 100 otherwise)
    pub min_rto: Option<u32>,
    /// overrides `fast_retransmit` if set
    pub fast_resend_threshold: Option<u32>,
    /// byte stream instead of preserving message boundaries
    pub stream_mode: bool,
    /// number of retransmissions of a single segment after which the engine declares the link dead
    pub dead_link_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::low_latency()
    }
}

impl EngineConfig {
    /// the low latency preset, also the default: nodelay, 10ms clock, fast
    ///  retransmit after 2 skipped ACKs, no congestion control
    pub fn low_latency() -> EngineConfig {
        EngineConfig {
            nodelay: true,
            interval: 10,
            fast_retransmit: 2,
            congestion_control_off: true,
            send_window: 128,
            recv_window: 128,
            mtu: 1400,
            min_rto: None,
            fast_resend_threshold: None,
            stream_mode: false,
            dead_link_threshold: 20,
        }
    }

    /// conservative settings close to plain TCP-like behavior
    pub fn normal() -> EngineConfig {
        EngineConfig {
            nodelay: false,
            interval: 40,
            fast_retransmit: 0,
            congestion_control_off: false,
            send_window: 32,
            recv_window: 128,
            mtu: 1400,
            min_rto: None,
            fast_resend_threshold: None,
            stream_mode: false,
            dead_link_threshold: 20,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < MIN_MTU {
            bail!("MTU of {} bytes is too small", self.mtu);
        }
        if self.mtu > MAX_MTU {
            bail!("MTU of {} bytes does not fit into a UDP datagram", self.mtu);
        }
        if self.send_window == 0 || self.recv_window == 0 {
            bail!("window sizes must be positive");
        }
        if self.interval == 0 {
            bail!("update interval must be positive");
        }
        if self.dead_link_threshold == 0 {
            bail!("dead link threshold must be positive");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.into())
    }

    pub fn apply_to(&self, engine: &mut dyn ReliableEngine) -> Result<(), EngineError> {
        debug!(conv = engine.conv(), config = ?self, "applying engine configuration");

        engine.set_nodelay(self.nodelay, self.interval, self.fast_retransmit, self.congestion_control_off);
        engine.set_window_size(self.send_window, self.recv_window);
        engine.set_mtu(self.mtu)?;
        if let Some(min_rto) = self.min_rto {
            engine.set_min_rto(min_rto);
        }
        if let Some(threshold) = self.fast_resend_threshold {
            engine.set_fast_resend(threshold);
        }
        engine.set_stream_mode(self.stream_mode);
        engine.set_dead_link(self.dead_link_threshold);
        Ok(())
    }
}
