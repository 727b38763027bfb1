use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use super::PaymentOutbox;
use crate::error::AppResult;

/// A durable queue whose pending rows can be re-signalled to their worker
#[async_trait]
pub trait SweepTarget: Send + Sync {
    fn name(&self) -> &'static str;

    /// Re-signals every row still owed an attempt; returns how many
    async fn resignal_pending(&self) -> AppResult<usize>;
}

#[async_trait]
impl SweepTarget for PaymentOutbox {
    fn name(&self) -> &'static str {
        "payment outbox"
    }

    async fn resignal_pending(&self) -> AppResult<usize> {
        let pending = self.pending_entries().await?;
        for entry in &pending {
            self.notify(entry.id);
        }
        Ok(pending.len())
    }
}

/// Periodically re-signals pending outbox rows. Signals are not durable, so
/// this is what makes delivery at-least-once after a crash or a dropped signal.
pub struct RecoverySweeper {
    targets: Vec<Arc<dyn SweepTarget>>,
    period: Duration,
}

impl RecoverySweeper {
    pub fn new(targets: Vec<Arc<dyn SweepTarget>>, period: Duration) -> Self {
        Self { targets, period }
    }

    pub async fn sweep_once(&self) -> usize {
        let mut total = 0;
        for target in &self.targets {
            match target.resignal_pending().await {
                Ok(0) => {}
                Ok(count) => {
                    info!("🧹 Recovery sweep re-signalled {} {} rows", count, target.name());
                    total += count;
                }
                Err(e) => error!("❌ Recovery sweep of {} failed: {}", target.name(), e),
            }
        }
        total
    }

    /// Start the sweep loop (runs in background). The first sweep runs
    /// immediately, which picks up everything left over from before a restart.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("✅ Recovery sweep started (every {:?})", self.period);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::address::FederationAddress;
    use crate::relay::PaymentInstruction;
    use crate::store::{MemoryStore, PaymentOutboxStore};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sweep_resignals_only_pending_entries() {
        let store = Arc::new(MemoryStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Arc::new(PaymentOutbox::new(store.clone(), 3, tx));

        let instruction = PaymentInstruction {
            asset_code: "USD".to_string(),
            amount: dec!(1),
            source_tenant: "alice".to_string(),
            destination_address: FederationAddress::parse("bob*test.org").unwrap(),
            issuer_address: None,
        };
        let done = outbox.enqueue(&instruction).await.unwrap();
        let waiting = outbox.enqueue(&instruction).await.unwrap();
        let exhausted = outbox.enqueue(&instruction).await.unwrap();
        // simulate a crash that lost the signals
        while rx.try_recv().is_ok() {}

        store.mark_processed(done).await.unwrap();
        store.abandon(exhausted).await.unwrap();

        let sweeper = RecoverySweeper::new(vec![outbox as Arc<dyn SweepTarget>], Duration::from_secs(60));
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(rx.try_recv().unwrap(), waiting);
        assert!(rx.try_recv().is_err());
    }
}
