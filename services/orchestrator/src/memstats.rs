//! Periodic memory-usage reporting.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

/// Process memory figures, in kilobytes where applicable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemStats {
    pub rss_kb: Option<u64>,
    pub peak_rss_kb: Option<u64>,
    pub virtual_kb: Option<u64>,
    pub threads: Option<u64>,
    /// Tokio tasks alive in the current runtime.
    pub alive_tasks: usize,
}

impl MemStats {
    /// Sample the current process.
    pub fn sample() -> Self {
        let mut stats = std::fs::read_to_string("/proc/self/status")
            .map(|status| parse_proc_status(&status))
            .unwrap_or_default();
        stats.alive_tasks = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or(0);
        stats
    }
}

/// Extract memory figures from the contents of `/proc/<pid>/status`.
pub fn parse_proc_status(status: &str) -> MemStats {
    let mut stats = MemStats::default();
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok());
        match key {
            "VmRSS" => stats.rss_kb = value,
            "VmHWM" => stats.peak_rss_kb = value,
            "VmSize" => stats.virtual_kb = value,
            "Threads" => stats.threads = value,
            _ => {}
        }
    }
    stats
}

/// Log a [`MemStats`] sample every `interval` until shutdown.
/// A zero interval disables reporting.
pub async fn run(interval: Duration, mut shutdown: watch::Receiver<bool>) {
    if interval.is_zero() {
        debug!("Memory reporter disabled");
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = MemStats::sample();
                info!(
                    rss_kb = stats.rss_kb,
                    peak_rss_kb = stats.peak_rss_kb,
                    virtual_kb = stats.virtual_kb,
                    threads = stats.threads,
                    alive_tasks = stats.alive_tasks,
                    "Memory usage"
                );
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Memory reporter stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_interval_disables_reporting() {
        let (_tx, rx) = watch::channel(false);
        tokio::time::timeout(Duration::from_secs(1), run(Duration::ZERO, rx))
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_proc_status() {
        let status = "Name:\torchestrator\nVmHWM:\t   20480 kB\nVmRSS:\t   10240 kB\nVmSize:\t  409600 kB\nThreads:\t9\n";
        let stats = parse_proc_status(status);
        assert_eq!(stats.rss_kb, Some(10240));
        assert_eq!(stats.peak_rss_kb, Some(20480));
        assert_eq!(stats.virtual_kb, Some(409600));
        assert_eq!(stats.threads, Some(9));
    }

    #[test]
    fn test_parse_proc_status_missing_fields() {
        let stats = parse_proc_status("Name:\tx\n");
        assert_eq!(stats, MemStats::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let reporter = tokio::spawn(run(Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), reporter)
            .await
            .unwrap()
            .unwrap();
    }
}
