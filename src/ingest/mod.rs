//! Ledger payment ingestion. One long-lived subscription per bridge account;
//! every inbound payment becomes a durable event before the resume cursor
//! moves past it.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::accounts::BridgeAccounts;
use crate::error::AppResult;
use crate::federation::address::LedgerAccountId;
use crate::gateway::{LedgerGateway, LedgerPayment, PaymentStream};
use crate::notify::InboundDelivery;
use crate::store::models::{BridgeAccount, NewInboundPayment};
use crate::store::LedgerCursorStore;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub struct StreamIngestor {
    gateway: Arc<dyn LedgerGateway>,
    accounts: Arc<BridgeAccounts>,
    cursors: Arc<dyn LedgerCursorStore>,
    delivery: Arc<InboundDelivery>,
    settings: StreamSettings,
    retry_budget: i32,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl StreamIngestor {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        accounts: Arc<BridgeAccounts>,
        cursors: Arc<dyn LedgerCursorStore>,
        delivery: Arc<InboundDelivery>,
        settings: StreamSettings,
        retry_budget: i32,
    ) -> Self {
        Self {
            gateway,
            accounts,
            cursors,
            delivery,
            settings,
            retry_budget,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes every existing bridge account from the last processed
    /// cursor, or from now when nothing was ever processed.
    ///
    /// The stored cursor is the highest token recorded by any feed. A feed
    /// that was behind the others at shutdown (in reconnect backoff, say)
    /// restarts past its own unrecorded payments.
    pub async fn start(self: &Arc<Self>) -> AppResult<usize> {
        let cursor = self
            .cursors
            .latest_processed_cursor()
            .await?
            .map(|cursor| cursor.cursor);
        let bridges = self.accounts.list().await?;

        info!(
            "🔄 Starting ingestion for {} accounts from cursor {}",
            bridges.len(),
            cursor.as_deref().unwrap_or("now")
        );

        for bridge in &bridges {
            self.subscribe(bridge, cursor.clone()).await;
        }
        Ok(bridges.len())
    }

    /// A bridge created at runtime only sees payments from now on
    pub async fn on_provisioned(self: &Arc<Self>, bridge: &BridgeAccount) {
        self.subscribe(bridge, None).await;
    }

    pub fn on_deleted(&self, tenant_id: &str) {
        if let Some(handle) = self.subscriptions.lock().remove(tenant_id) {
            handle.abort();
            info!("⏹️ Ingestion cancelled for tenant {}", tenant_id);
        }
    }

    pub fn is_subscribed(&self, tenant_id: &str) -> bool {
        self.subscriptions
            .lock()
            .get(tenant_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    async fn subscribe(self: &Arc<Self>, bridge: &BridgeAccount, cursor: Option<String>) {
        let account = bridge.main_account();

        // pin "now" here so it means the moment of subscription, and so a
        // reconnect resumes from it rather than from a later "now"
        let start = match cursor {
            Some(cursor) => Some(cursor),
            None => self.pin_now(&bridge.tenant_id, &account).await,
        };
        let first = match &start {
            Some(start) => match self.gateway.subscribe_payments(&account, Some(start.clone())).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!("⚠️  Could not open payment feed for {}: {}", bridge.tenant_id, e);
                    None
                }
            },
            None => None,
        };

        let ingestor = self.clone();
        let tenant_id = bridge.tenant_id.clone();
        let handle = tokio::spawn(ingestor.follow(tenant_id.clone(), account, start, first));

        if let Some(previous) = self.subscriptions.lock().insert(tenant_id, handle) {
            previous.abort();
        }
    }

    /// Runs until aborted: consume the feed, and on any error reconnect from
    /// the last cursor that was durably recorded, or from where the feed
    /// started when nothing was recorded yet
    async fn follow(
        self: Arc<Self>,
        tenant_id: String,
        account: LedgerAccountId,
        mut resume: Option<String>,
        mut next_stream: Option<PaymentStream>,
    ) {
        loop {
            if resume.is_none() {
                resume = self.pin_now(&tenant_id, &account).await;
            }
            let stream = match (next_stream.take(), &resume) {
                (Some(stream), _) => Ok(stream),
                (None, Some(cursor)) => {
                    self.gateway
                        .subscribe_payments(&account, Some(cursor.clone()))
                        .await
                }
                (None, None) => {
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                    continue;
                }
            };

            match stream {
                Ok(mut stream) => {
                    debug!("Payment feed open for {} at {:?}", tenant_id, resume);
                    while let Some(item) = stream.next().await {
                        let payment = match item {
                            Ok(payment) => payment,
                            Err(e) => {
                                warn!("⚠️  Payment feed for {} dropped: {}", tenant_id, e);
                                break;
                            }
                        };
                        match self.handle_payment(&tenant_id, &account, &payment).await {
                            Ok(()) => resume = Some(payment.paging_token),
                            Err(e) => {
                                // not recorded, so the reconnect replays it
                                error!(
                                    "❌ Failed to record payment {} for {}: {}",
                                    payment.paging_token, tenant_id, e
                                );
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("⚠️  Reconnecting payment feed for {} failed: {}", tenant_id, e),
            }

            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    async fn pin_now(&self, tenant_id: &str, account: &LedgerAccountId) -> Option<String> {
        match self.gateway.latest_paging_token(account).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("⚠️  Could not find the feed position for {}: {}", tenant_id, e);
                None
            }
        }
    }

    /// Records one feed item. Returns only after the cursor (and the event,
    /// for inbound payments) is durable.
    #[instrument(skip(self, account, payment), fields(token = %payment.paging_token))]
    pub async fn handle_payment(
        &self,
        tenant_id: &str,
        account: &LedgerAccountId,
        payment: &LedgerPayment,
    ) -> AppResult<()> {
        let inbound_asset = match &payment.asset {
            Some(asset) if payment.to == account.public_key && payment.from != account.public_key => {
                asset
            }
            _ => {
                self.cursors.advance_cursor(&payment.paging_token).await?;
                return Ok(());
            }
        };

        let recorded = self
            .cursors
            .record_inbound_payment(
                &NewInboundPayment {
                    tenant_id: tenant_id.to_string(),
                    paging_token: payment.paging_token.clone(),
                    asset_code: inbound_asset.code.clone(),
                    asset_issuer: inbound_asset.issuer.clone(),
                    amount: payment.amount,
                },
                self.retry_budget,
            )
            .await?;

        match recorded {
            Some(event) => {
                info!(
                    "📥 Inbound payment {} for {}: {} {}",
                    event.id, tenant_id, event.amount, event.asset_code
                );
                self.delivery.notify(event.id);
            }
            None => debug!("Payment {} already recorded", payment.paging_token),
        }
        Ok(())
    }
}
