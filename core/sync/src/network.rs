//! Network quality monitoring.
//!
//! Samples feed a rolling window; the window's success ratio and mean latency
//! determine the quality tier, the coarse connectivity state and the
//! recommended sync strategy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, info};

use driftsync_common::{Error, Priority, Result};

/// Quality tier of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NetworkQuality {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkQuality {
    fn degraded(self) -> Self {
        match self {
            NetworkQuality::Excellent => NetworkQuality::Good,
            NetworkQuality::Good => NetworkQuality::Fair,
            NetworkQuality::Fair | NetworkQuality::Poor => NetworkQuality::Poor,
            NetworkQuality::Offline => NetworkQuality::Offline,
        }
    }
}

/// Coarse connectivity state published to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityState {
    Unknown,
    Offline,
    OnlinePoor,
    OnlineGood,
    OnlineExcellent,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            ConnectivityState::OnlinePoor
                | ConnectivityState::OnlineGood
                | ConnectivityState::OnlineExcellent
        )
    }
}

impl From<NetworkQuality> for ConnectivityState {
    fn from(quality: NetworkQuality) -> Self {
        match quality {
            NetworkQuality::Offline => ConnectivityState::Offline,
            NetworkQuality::Poor | NetworkQuality::Fair => ConnectivityState::OnlinePoor,
            NetworkQuality::Good => ConnectivityState::OnlineGood,
            NetworkQuality::Excellent => ConnectivityState::OnlineExcellent,
        }
    }
}

/// One probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkQualityMeasurement {
    pub quality: NetworkQuality,
    pub latency_ms: Option<u64>,
    pub success: bool,
    pub sampled_at: DateTime<Utc>,
}

/// What the engine should do under the current link quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStrategy {
    pub batch_size: usize,
    pub retry_delay: Duration,
    /// Lowest tier allowed to drain.
    pub min_priority: Priority,
}

impl SyncStrategy {
    pub fn allows(&self, priority: Priority) -> bool {
        priority >= self.min_priority
    }
}

/// Monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Number of samples in the rolling window.
    pub window_size: usize,
    /// Upper bound for one active probe.
    pub probe_timeout: Duration,
    /// Mean latency at or below which the link is excellent.
    pub excellent_latency: Duration,
    /// Mean latency at or below which the link is good.
    pub good_latency: Duration,
    /// Mean latency at or below which the link is fair; above is poor.
    pub fair_latency: Duration,
    /// Below this success ratio the link counts as offline.
    pub min_success_ratio: f64,
    /// Below this success ratio the tier is degraded one step.
    pub stable_success_ratio: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            probe_timeout: Duration::from_secs(5),
            excellent_latency: Duration::from_millis(100),
            good_latency: Duration::from_millis(300),
            fair_latency: Duration::from_millis(1000),
            min_success_ratio: 0.5,
            stable_success_ratio: 0.8,
        }
    }
}

impl NetworkConfig {
    fn quality_for_latency(&self, latency: Duration) -> NetworkQuality {
        if latency <= self.excellent_latency {
            NetworkQuality::Excellent
        } else if latency <= self.good_latency {
            NetworkQuality::Good
        } else if latency <= self.fair_latency {
            NetworkQuality::Fair
        } else {
            NetworkQuality::Poor
        }
    }
}

/// Active connectivity check.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Round-trip to the remote; returns the observed latency.
    async fn probe(&self) -> Result<Duration>;
}

/// Probe with a fixed answer, for tools without a real endpoint.
pub struct StaticProbe {
    latency: Option<Duration>,
}

impl StaticProbe {
    pub fn online(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }

    pub fn offline() -> Self {
        Self { latency: None }
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn probe(&self) -> Result<Duration> {
        self.latency
            .ok_or_else(|| Error::Network("No route to remote".to_string()))
    }
}

struct Window {
    samples: VecDeque<NetworkQualityMeasurement>,
    quality: Option<NetworkQuality>,
}

/// Rolling-window network monitor.
pub struct NetworkQualityMonitor {
    probe: Arc<dyn NetworkProbe>,
    config: NetworkConfig,
    window: Mutex<Window>,
    state_tx: watch::Sender<ConnectivityState>,
}

impl NetworkQualityMonitor {
    pub fn new(probe: Arc<dyn NetworkProbe>, config: NetworkConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Unknown);
        Self {
            probe,
            config,
            window: Mutex::new(Window {
                samples: VecDeque::new(),
                quality: None,
            }),
            state_tx,
        }
    }

    /// Run the probe once (bounded by the probe timeout) and record the result.
    pub async fn sample(&self) -> NetworkQualityMeasurement {
        let started = Instant::now();
        let measurement = match timeout(self.config.probe_timeout, self.probe.probe()).await {
            Ok(Ok(latency)) => NetworkQualityMeasurement {
                quality: self.config.quality_for_latency(latency),
                latency_ms: Some(latency.as_millis() as u64),
                success: true,
                sampled_at: Utc::now(),
            },
            Ok(Err(e)) => {
                debug!("Network probe failed: {}", e);
                failed_measurement()
            }
            Err(_) => {
                debug!("Network probe timed out after {:?}", started.elapsed());
                failed_measurement()
            }
        };

        self.record(measurement.clone());
        measurement
    }

    /// Feed a measurement obtained elsewhere (passive observation).
    pub fn record(&self, measurement: NetworkQualityMeasurement) -> ConnectivityState {
        let quality = {
            let mut window = self.lock();
            window.samples.push_back(measurement);
            while window.samples.len() > self.config.window_size.max(1) {
                window.samples.pop_front();
            }
            let quality = self.derive_quality(&window.samples);
            window.quality = quality;
            quality
        };

        let state = quality.map(ConnectivityState::from).unwrap_or(ConnectivityState::Unknown);
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Connectivity changed: {:?} -> {:?}", previous, state);
        }
        state
    }

    /// Current connectivity state.
    pub fn current_state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Current quality tier, `None` before the first sample.
    pub fn current_quality(&self) -> Option<NetworkQuality> {
        self.lock().quality
    }

    /// Share of successful samples in the window.
    pub fn stability_score(&self) -> f64 {
        let window = self.lock();
        if window.samples.is_empty() {
            return 0.0;
        }
        let ok = window.samples.iter().filter(|s| s.success).count();
        ok as f64 / window.samples.len() as f64
    }

    /// Strategy for the current quality tier.
    pub fn recommended_strategy(&self) -> SyncStrategy {
        strategy_for(self.current_quality().unwrap_or(NetworkQuality::Offline))
    }

    /// Watch connectivity state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Sample every `period` until `shutdown` flips to true.
    pub async fn run_sampler(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Network sampler stopping");
                        break;
                    }
                }
            }
        }
    }

    fn derive_quality(&self, samples: &VecDeque<NetworkQualityMeasurement>) -> Option<NetworkQuality> {
        if samples.is_empty() {
            return None;
        }

        let successes: Vec<u64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency_ms.unwrap_or(0))
            .collect();
        let ratio = successes.len() as f64 / samples.len() as f64;
        if successes.is_empty() || ratio < self.config.min_success_ratio {
            return Some(NetworkQuality::Offline);
        }

        let mean = successes.iter().sum::<u64>() / successes.len() as u64;
        let quality = self.config.quality_for_latency(Duration::from_millis(mean));
        if ratio < self.config.stable_success_ratio {
            Some(quality.degraded())
        } else {
            Some(quality)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Strategy table. Degraded links only carry urgent tiers.
pub fn strategy_for(quality: NetworkQuality) -> SyncStrategy {
    let (batch_size, retry_secs, min_priority) = match quality {
        NetworkQuality::Offline => (5, 30, Priority::Critical),
        NetworkQuality::Poor => (5, 10, Priority::High),
        NetworkQuality::Fair => (10, 5, Priority::Medium),
        NetworkQuality::Good => (25, 2, Priority::Low),
        NetworkQuality::Excellent => (50, 1, Priority::Low),
    };
    SyncStrategy {
        batch_size,
        retry_delay: Duration::from_secs(retry_secs),
        min_priority,
    }
}

/// Measurement for a link observed to be working with the given latency.
pub fn online_measurement(latency: Duration, config: &NetworkConfig) -> NetworkQualityMeasurement {
    NetworkQualityMeasurement {
        quality: config.quality_for_latency(latency),
        latency_ms: Some(latency.as_millis() as u64),
        success: true,
        sampled_at: Utc::now(),
    }
}

/// Measurement for a failed round-trip.
pub fn failed_measurement() -> NetworkQualityMeasurement {
    NetworkQualityMeasurement {
        quality: NetworkQuality::Offline,
        latency_ms: None,
        success: false,
        sampled_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProbe {
        answers: StdMutex<VecDeque<Option<Duration>>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Option<Duration>>) -> Self {
            Self {
                answers: StdMutex::new(answers.into()),
            }
        }
    }

    #[async_trait]
    impl NetworkProbe for ScriptedProbe {
        async fn probe(&self) -> Result<Duration> {
            match self.answers.lock().unwrap().pop_front().flatten() {
                Some(latency) => Ok(latency),
                None => Err(Error::Network("unreachable".to_string())),
            }
        }
    }

    struct SlowProbe;

    #[async_trait]
    impl NetworkProbe for SlowProbe {
        async fn probe(&self) -> Result<Duration> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Duration::from_millis(1))
        }
    }

    fn monitor(probe: impl NetworkProbe + 'static) -> NetworkQualityMonitor {
        NetworkQualityMonitor::new(Arc::new(probe), NetworkConfig::default())
    }

    #[tokio::test]
    async fn test_starts_unknown_with_critical_only_strategy() {
        let m = monitor(StaticProbe::offline());
        assert_eq!(m.current_state(), ConnectivityState::Unknown);
        assert_eq!(m.recommended_strategy().min_priority, Priority::Critical);
    }

    #[tokio::test]
    async fn test_failed_samples_mean_offline() {
        let m = monitor(StaticProbe::offline());
        let sample = m.sample().await;
        assert!(!sample.success);
        assert_eq!(m.current_state(), ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_latency_tiers() {
        let m = monitor(StaticProbe::online(Duration::from_millis(50)));
        m.sample().await;
        assert_eq!(m.current_state(), ConnectivityState::OnlineExcellent);

        let m = monitor(StaticProbe::online(Duration::from_millis(200)));
        m.sample().await;
        assert_eq!(m.current_state(), ConnectivityState::OnlineGood);

        let m = monitor(StaticProbe::online(Duration::from_millis(600)));
        m.sample().await;
        assert_eq!(m.current_quality(), Some(NetworkQuality::Fair));
        assert_eq!(m.current_state(), ConnectivityState::OnlinePoor);
        assert_eq!(m.recommended_strategy().min_priority, Priority::Medium);

        let m = monitor(StaticProbe::online(Duration::from_secs(3)));
        m.sample().await;
        assert_eq!(m.current_quality(), Some(NetworkQuality::Poor));
        assert_eq!(m.recommended_strategy().min_priority, Priority::High);
    }

    #[tokio::test]
    async fn test_flaky_link_is_degraded() {
        let ms = Some(Duration::from_millis(50));
        // 3 of 5 succeed: online, but below the stable ratio.
        let m = monitor(ScriptedProbe::new(vec![ms, None, ms, None, ms]));
        for _ in 0..5 {
            m.sample().await;
        }
        assert!((m.stability_score() - 0.6).abs() < f64::EPSILON);
        assert_eq!(m.current_quality(), Some(NetworkQuality::Good));
    }

    #[tokio::test]
    async fn test_window_recovers_after_outage() {
        let ms = Some(Duration::from_millis(50));
        let m = monitor(ScriptedProbe::new(vec![None, None, ms, ms, ms, ms, ms]));
        let mut rx = m.subscribe();

        m.sample().await;
        assert_eq!(m.current_state(), ConnectivityState::Offline);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        for _ in 0..5 {
            m.sample().await;
        }
        assert!(m.current_state().is_online());
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let m = monitor(SlowProbe);
        let sample = m.sample().await;
        assert!(!sample.success);
        assert_eq!(m.current_state(), ConnectivityState::Offline);
    }

    #[test]
    fn test_strategy_mapping() {
        assert!(!strategy_for(NetworkQuality::Offline).allows(Priority::High));
        assert!(strategy_for(NetworkQuality::Offline).allows(Priority::Critical));
        assert!(strategy_for(NetworkQuality::Poor).allows(Priority::High));
        assert!(!strategy_for(NetworkQuality::Poor).allows(Priority::Medium));
        assert!(strategy_for(NetworkQuality::Fair).allows(Priority::Medium));
        assert!(!strategy_for(NetworkQuality::Fair).allows(Priority::Low));
        assert!(strategy_for(NetworkQuality::Good).allows(Priority::Low));
        assert!(strategy_for(NetworkQuality::Excellent).allows(Priority::Low));
    }
}
