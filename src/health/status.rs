use std::collections::VecDeque;

use crate::types::message::epoch_ms;

/// Point-in-time health metrics for one monitored connection.
///
/// Latency samples live in a rolling window of bounded size; the packet
/// loss ratio relates consecutive missed pongs to the samples that did
/// arrive. The zombie flag is sticky: it only clears on a fresh pong.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    latency_window: VecDeque<u64>,
    window_size: usize,
    pub average_latency: f64,
    pub packet_loss: f64,
    pub last_ping_time: Option<u64>,
    pub last_pong_time: Option<u64>,
    pub missed_pong_count: u32,
    pub is_zombie: bool,
    pub reconnect_count: u32,
    pub connection_start: u64,
}

impl HealthStatus {
    pub fn new(window_size: usize) -> Self {
        Self {
            latency_window: VecDeque::with_capacity(window_size),
            window_size,
            average_latency: 0.0,
            packet_loss: 0.0,
            last_ping_time: None,
            last_pong_time: None,
            missed_pong_count: 0,
            is_zombie: false,
            reconnect_count: 0,
            connection_start: epoch_ms(),
        }
    }

    /// Records a pong. `latency` is absent for lightweight `"pong"` frames
    /// that carry no timestamp; those still count as a response.
    pub fn record_pong(&mut self, latency: Option<u64>, now: u64) {
        if let Some(latency) = latency {
            self.latency_window.push_back(latency);
            while self.latency_window.len() > self.window_size {
                self.latency_window.pop_front();
            }
            self.average_latency = self.latency_window.iter().sum::<u64>() as f64
                / self.latency_window.len() as f64;
        }
        self.last_pong_time = Some(now);
        self.missed_pong_count = 0;
        self.is_zombie = false;
        self.recompute_packet_loss();
    }

    /// Records a pong timeout and returns the new consecutive-miss count.
    pub fn record_missed_pong(&mut self) -> u32 {
        self.missed_pong_count += 1;
        self.recompute_packet_loss();
        self.missed_pong_count
    }

    /// Clears heartbeat failure state after a successful forced reconnect.
    pub fn reset_after_reconnect(&mut self) {
        self.missed_pong_count = 0;
        self.is_zombie = false;
        self.recompute_packet_loss();
    }

    pub fn samples(&self) -> usize {
        self.latency_window.len()
    }

    fn recompute_packet_loss(&mut self) {
        let total = self.latency_window.len() as f64 + self.missed_pong_count as f64;
        self.packet_loss = if total > 0.0 {
            self.missed_pong_count as f64 / total
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_only_most_recent_samples() {
        let mut status = HealthStatus::new(3);
        for latency in [10, 20, 30, 40, 50] {
            status.record_pong(Some(latency), epoch_ms());
        }

        assert_eq!(status.samples(), 3);
        // 30, 40, 50 remain
        assert!((status.average_latency - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_is_arithmetic_mean() {
        let mut status = HealthStatus::new(10);
        status.record_pong(Some(50), 1050);

        assert!((status.average_latency - 50.0).abs() < f64::EPSILON);
        assert_eq!(status.last_pong_time, Some(1050));
    }

    #[test]
    fn test_packet_loss_ratio() {
        let mut status = HealthStatus::new(10);
        status.record_pong(Some(10), epoch_ms());
        status.record_pong(Some(12), epoch_ms());
        status.record_missed_pong();
        status.record_missed_pong();

        // 2 missed out of 2 samples + 2 missed
        assert!((status.packet_loss - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pong_resets_missed_count_and_zombie_flag() {
        let mut status = HealthStatus::new(10);
        status.record_missed_pong();
        status.record_missed_pong();
        status.record_missed_pong();
        status.is_zombie = true;

        status.record_pong(Some(5), epoch_ms());

        assert_eq!(status.missed_pong_count, 0);
        assert!(!status.is_zombie);
        assert!((status.packet_loss - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_raw_pong_counts_without_latency_sample() {
        let mut status = HealthStatus::new(10);
        status.record_missed_pong();
        status.record_pong(None, 123);

        assert_eq!(status.samples(), 0);
        assert_eq!(status.missed_pong_count, 0);
        assert_eq!(status.last_pong_time, Some(123));
    }
}
