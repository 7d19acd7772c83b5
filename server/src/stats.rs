//! Per-session traffic counters, dumped when a session closes.

use log::debug;
use shared::protocol::code_name;
use shared::PlayerIndex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeCount {
    pub messages: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct DirectionStats {
    per_code: BTreeMap<u16, CodeCount>,
    total: CodeCount,
    window_start: Option<Instant>,
    window: CodeCount,
    peak_per_second: CodeCount,
}

impl DirectionStats {
    fn record(&mut self, code: u16, len: usize, now: Instant) {
        let entry = self.per_code.entry(code).or_default();
        entry.messages += 1;
        entry.bytes += len as u64;
        self.total.messages += 1;
        self.total.bytes += len as u64;

        let start = *self.window_start.get_or_insert(now);
        if now.duration_since(start) >= Duration::from_secs(1) {
            self.window_start = Some(now);
            self.window = CodeCount::default();
        }
        self.window.messages += 1;
        self.window.bytes += len as u64;
        self.peak_per_second.messages = self.peak_per_second.messages.max(self.window.messages);
        self.peak_per_second.bytes = self.peak_per_second.bytes.max(self.window.bytes);
    }

    pub fn total(&self) -> CodeCount {
        self.total
    }

    pub fn for_code(&self, code: u16) -> CodeCount {
        self.per_code.get(&code).copied().unwrap_or_default()
    }

    pub fn peak_per_second(&self) -> CodeCount {
        self.peak_per_second
    }
}

#[derive(Debug, Default)]
pub struct TrafficStats {
    sent: DirectionStats,
    received: DirectionStats,
}

impl TrafficStats {
    pub fn record_sent(&mut self, code: u16, len: usize) {
        self.sent.record(code, len, Instant::now());
    }

    pub fn record_received(&mut self, code: u16, len: usize) {
        self.received.record(code, len, Instant::now());
    }

    pub fn sent(&self) -> &DirectionStats {
        &self.sent
    }

    pub fn received(&self) -> &DirectionStats {
        &self.received
    }

    pub fn log_summary(&self, player: PlayerIndex) {
        for (label, direction) in [("sent", &self.sent), ("received", &self.received)] {
            debug!(
                "Player {} {} {} messages / {} bytes (peak {}/s, {} bytes/s)",
                player,
                label,
                direction.total.messages,
                direction.total.bytes,
                direction.peak_per_second.messages,
                direction.peak_per_second.bytes
            );
            for (code, count) in &direction.per_code {
                debug!(
                    "  {:<18} {:>6} msgs {:>8} bytes",
                    code_name(*code),
                    count.messages,
                    count.bytes
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{MSG_MESSAGE, MSG_PLAYER_UPDATE};

    #[test]
    fn test_counts_per_code() {
        let mut stats = TrafficStats::default();
        stats.record_sent(MSG_PLAYER_UPDATE, 30);
        stats.record_sent(MSG_PLAYER_UPDATE, 30);
        stats.record_sent(MSG_MESSAGE, 10);
        stats.record_received(MSG_MESSAGE, 12);

        assert_eq!(
            stats.sent().for_code(MSG_PLAYER_UPDATE),
            CodeCount {
                messages: 2,
                bytes: 60
            }
        );
        assert_eq!(stats.sent().total().bytes, 70);
        assert_eq!(stats.received().total().messages, 1);
    }

    #[test]
    fn test_peak_rate_window() {
        let mut direction = DirectionStats::default();
        let start = Instant::now();
        for i in 0..5 {
            direction.record(1, 10, start + Duration::from_millis(i * 100));
        }
        direction.record(1, 10, start + Duration::from_millis(1500));
        assert_eq!(direction.peak_per_second().messages, 5);
        assert_eq!(direction.total().messages, 6);
    }
}
