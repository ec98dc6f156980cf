//! Fault-injecting datagram sink for exercising the reliability paths.
//!
//! [`LossySink`] wraps any [`DatagramSink`] and applies a seeded fault model
//! to every outgoing datagram:
//!
//! | Fault       | Description                                            |
//! |-------------|--------------------------------------------------------|
//! | Loss        | Drop a datagram with probability `loss_rate`.          |
//! | Drop-Nth    | Drop every `drop_every`-th datagram, deterministically. |
//! | Duplication | Send a datagram twice with probability `duplicate_rate`. |
//!
//! A dropped datagram still reports its full length, exactly as a datagram
//! lost in the network would.  The same seed always drops the same datagrams.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::socket::DatagramSink;

/// Fault model.  Probabilities are clamped to `[0.0, 1.0]` (NaN counts as
/// zero) when the sink is built, however the fields were set.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    /// Drop every n-th datagram (1-based); `None` disables.
    pub drop_every: Option<u64>,
    pub duplicate_rate: f64,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // Transparent pass-through.
        Self {
            loss_rate: 0.0,
            drop_every: None,
            duplicate_rate: 0.0,
            seed: 0,
        }
    }
}

fn probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

impl SimulatorConfig {
    pub fn with_loss(mut self, rate: f64) -> Self {
        self.loss_rate = probability(rate);
        self
    }

    pub fn with_drop_every(mut self, n: u64) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }

    pub fn with_duplicates(mut self, rate: f64) -> Self {
        self.duplicate_rate = probability(rate);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

#[derive(Debug)]
pub struct LossySink {
    inner: Arc<dyn DatagramSink>,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl LossySink {
    pub fn new(inner: Arc<dyn DatagramSink>, mut config: SimulatorConfig) -> Self {
        config.loss_rate = probability(config.loss_rate);
        config.duplicate_rate = probability(config.duplicate_rate);
        config.drop_every = config.drop_every.filter(|&n| n > 0);
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Datagrams offered to this sink so far.
    pub fn offered(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Decide the fate of the `n`-th datagram: (drop, duplicate).
    fn roll(&self, n: u64) -> (bool, bool) {
        let nth = self.config.drop_every.is_some_and(|every| n % every == 0);
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let lost = rng.gen_bool(self.config.loss_rate);
        let dup = rng.gen_bool(self.config.duplicate_rate);
        (nth || lost, dup)
    }
}

#[async_trait]
impl DatagramSink for LossySink {
    async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let (drop, duplicate) = self.roll(n);
        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("[sim] dropping datagram #{n} ({} bytes)", datagram.len());
            return Ok(datagram.len());
        }
        let written = self.inner.send_datagram(datagram).await?;
        if duplicate {
            log::debug!("[sim] duplicating datagram #{n}");
            self.inner.send_datagram(datagram).await?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct Collect(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl DatagramSink for Collect {
        async fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
            let _ = self.0.send(datagram.to_vec());
            Ok(datagram.len())
        }
    }

    fn collect() -> (Arc<dyn DatagramSink>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collect(tx)), rx)
    }

    #[tokio::test]
    async fn default_passes_everything_through() {
        let (inner, mut rx) = collect();
        let sink = LossySink::new(inner, SimulatorConfig::default());
        for i in 0..20u8 {
            assert_eq!(sink.send_datagram(&[i]).await.unwrap(), 1);
        }
        for i in 0..20u8 {
            assert_eq!(rx.try_recv().unwrap(), vec![i]);
        }
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn drop_every_nth_is_deterministic() {
        let (inner, mut rx) = collect();
        let sink = LossySink::new(inner, SimulatorConfig::default().with_drop_every(3));
        for i in 1..=9u8 {
            sink.send_datagram(&[i]).await.unwrap();
        }
        let mut got = Vec::new();
        while let Ok(d) = rx.try_recv() {
            got.push(d[0]);
        }
        assert_eq!(got, vec![1, 2, 4, 5, 7, 8]);
        assert_eq!(sink.dropped(), 3);
        assert_eq!(sink.offered(), 9);
    }

    #[tokio::test]
    async fn same_seed_drops_same_datagrams() {
        async fn survivors(seed: u64) -> Vec<u8> {
            let (inner, mut rx) = collect();
            let sink = LossySink::new(
                inner,
                SimulatorConfig::default().with_loss(0.4).with_seed(seed),
            );
            for i in 0..100u8 {
                sink.send_datagram(&[i]).await.unwrap();
            }
            let mut got = Vec::new();
            while let Ok(d) = rx.try_recv() {
                got.push(d[0]);
            }
            got
        }
        let a = survivors(7).await;
        assert_eq!(a, survivors(7).await);
        assert!(a.len() < 100 && !a.is_empty());
    }

    #[tokio::test]
    async fn full_duplication_sends_twice() {
        let (inner, mut rx) = collect();
        let sink = LossySink::new(inner, SimulatorConfig::default().with_duplicates(1.0));
        sink.send_datagram(b"x").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"x");
        assert_eq!(rx.try_recv().unwrap(), b"x");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_range_fields_are_clamped() {
        let (inner, mut rx) = collect();
        let sink = LossySink::new(
            inner,
            SimulatorConfig {
                loss_rate: 2.0,
                drop_every: Some(0),
                duplicate_rate: -1.0,
                seed: 3,
            },
        );
        for i in 0..10u8 {
            assert_eq!(sink.send_datagram(&[i]).await.unwrap(), 1);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.dropped(), 10);

        let (inner, mut rx) = collect();
        let sink = LossySink::new(
            inner,
            SimulatorConfig {
                loss_rate: f64::NAN,
                duplicate_rate: f64::NAN,
                ..SimulatorConfig::default()
            },
        );
        sink.send_datagram(b"y").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"y");
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.dropped(), 0);
    }
}
