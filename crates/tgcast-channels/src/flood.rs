//! Flood gate: global backpressure tracking for a provider account.
//!
//! Once the provider answers with a flood wait, every further send is
//! short-circuited with the remaining wait instead of hitting the API again.
//! Lock-free: two atomics, shared across all worker tasks.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::provider::{Media, MessagingProvider, SendError, SentMessage};

/// Snapshot of flood gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FloodGateStats {
    /// Flood waits recorded since startup.
    pub total_blocks: u64,
    /// Seconds until the current block lifts, if blocked.
    pub blocked_for_secs: Option<u64>,
}

/// Tracks the provider-imposed block window.
#[derive(Debug, Default)]
pub struct FloodGate {
    /// Unix seconds until which sends are blocked (0 = open).
    blocked_until: AtomicI64,
    total_blocks: AtomicU64,
}

impl FloodGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flood wait reported by the provider.
    pub fn record(&self, wait_secs: u64) {
        self.record_at(chrono::Utc::now().timestamp(), wait_secs);
    }

    /// Remaining block in seconds, `None` when sends are allowed.
    pub fn remaining(&self) -> Option<u64> {
        self.remaining_at(chrono::Utc::now().timestamp())
    }

    /// Lift the block manually.
    pub fn clear(&self) {
        if self.blocked_until.swap(0, Ordering::Relaxed) != 0 {
            tracing::info!("✅ Flood gate cleared");
        }
    }

    pub fn stats(&self) -> FloodGateStats {
        FloodGateStats {
            total_blocks: self.total_blocks.load(Ordering::Relaxed),
            blocked_for_secs: self.remaining(),
        }
    }

    fn record_at(&self, now: i64, wait_secs: u64) {
        let until = now.saturating_add(wait_secs as i64);
        // Overlapping waits keep the later deadline.
        self.blocked_until.fetch_max(until, Ordering::Relaxed);
        self.total_blocks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("⏱️ Flood wait: provider blocked for {}s", wait_secs);
    }

    fn remaining_at(&self, now: i64) -> Option<u64> {
        let until = self.blocked_until.load(Ordering::Relaxed);
        (until > now).then(|| (until - now) as u64)
    }
}

/// Provider wrapper that consults a [`FloodGate`] before every send.
pub struct GatedProvider<P> {
    inner: P,
    gate: Arc<FloodGate>,
}

impl<P: MessagingProvider> GatedProvider<P> {
    pub fn new(inner: P, gate: Arc<FloodGate>) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &Arc<FloodGate> {
        &self.gate
    }
}

#[async_trait]
impl<P: MessagingProvider> MessagingProvider for GatedProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn connect(&self) -> Result<(), SendError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<(), SendError> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn send(
        &self,
        destination: &str,
        content: &str,
        media: Option<Media<'_>>,
    ) -> Result<SentMessage, SendError> {
        if let Some(seconds) = self.gate.remaining() {
            tracing::debug!("⏸️ Flood gate closed, {}s left, skipping {}", seconds, destination);
            return Err(SendError::FloodWait { seconds });
        }

        let result = self.inner.send(destination, content, media).await;
        if let Err(SendError::FloodWait { seconds }) = &result {
            self.gate.record(*seconds);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_gate_open_by_default() {
        let gate = FloodGate::new();
        assert_eq!(gate.remaining_at(1_000), None);
        assert_eq!(gate.stats().total_blocks, 0);
    }

    #[test]
    fn test_gate_blocks_until_deadline() {
        let gate = FloodGate::new();
        gate.record_at(1_000, 30);
        assert_eq!(gate.remaining_at(1_000), Some(30));
        assert_eq!(gate.remaining_at(1_029), Some(1));
        assert_eq!(gate.remaining_at(1_030), None);
    }

    #[test]
    fn test_overlapping_waits_keep_later_deadline() {
        let gate = FloodGate::new();
        gate.record_at(1_000, 60);
        gate.record_at(1_010, 5);
        assert_eq!(gate.remaining_at(1_020), Some(40));
        assert_eq!(gate.total_blocks.load(Ordering::Relaxed), 2);
    }

    struct FloodingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessagingProvider for FloodingProvider {
        fn name(&self) -> &str {
            "flooding"
        }
        async fn connect(&self) -> Result<(), SendError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), SendError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn send(
            &self,
            _destination: &str,
            _content: &str,
            _media: Option<Media<'_>>,
        ) -> Result<SentMessage, SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SendError::FloodWait { seconds: 120 })
        }
    }

    #[tokio::test]
    async fn test_gated_provider_short_circuits_after_flood() {
        let gate = Arc::new(FloodGate::new());
        let provider = GatedProvider::new(
            FloodingProvider { calls: AtomicUsize::new(0) },
            gate.clone(),
        );

        let first = provider.send("@a", "hi", None).await.unwrap_err();
        assert_eq!(first, SendError::FloodWait { seconds: 120 });

        let second = provider.send("@b", "hi", None).await.unwrap_err();
        assert!(matches!(second, SendError::FloodWait { seconds } if seconds <= 120));
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
        let stats = provider.gate().stats();
        assert_eq!(stats.total_blocks, 1);
        assert!(stats.blocked_for_secs.is_some_and(|secs| secs <= 120));

        gate.clear();
        assert!(gate.remaining().is_none());
    }
}
