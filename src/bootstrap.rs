use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    accounts::BridgeAccounts,
    api::handler::AppState,
    config::Config,
    error::AppResult,
    federation::{Federation, FederationResolver, RemoteFederationClient},
    gateway::{HorizonConfig, HorizonGateway, LedgerGateway, SecretKey},
    ingest::StreamIngestor,
    notify::{
        CoreBankingNotifier, HttpCoreBankingNotifier, InboundDelivery, InboundDeliveryWorker,
        LoggingNotifier,
    },
    relay::{sweeper::SweepTarget, PaymentOutbox, PaymentRelayWorker, RecoverySweeper},
    service::BridgeService,
    store::{
        BridgeAccountStore, InboundEventStore, LedgerCursorStore, MemoryStore,
        PaymentOutboxStore, PostgresStore,
    },
    vault::VaultNettingEngine,
};

/// One backing store seen through each of its roles
struct Stores {
    bridges: Arc<dyn BridgeAccountStore>,
    outbox: Arc<dyn PaymentOutboxStore>,
    cursors: Arc<dyn LedgerCursorStore>,
    events: Arc<dyn InboundEventStore>,
}

impl Stores {
    fn of<S>(store: Arc<S>) -> Self
    where
        S: BridgeAccountStore + PaymentOutboxStore + LedgerCursorStore + InboundEventStore + 'static,
    {
        Self {
            bridges: store.clone(),
            outbox: store.clone(),
            cursors: store.clone(),
            events: store,
        }
    }
}

async fn initialize_stores(config: &Config) -> AppResult<Stores> {
    match &config.database_url {
        Some(url) => Ok(Stores::of(Arc::new(PostgresStore::connect(url).await?))),
        None => {
            warn!("⚠️  DATABASE_URL not set - using the in-memory store, nothing survives a restart");
            Ok(Stores::of(Arc::new(MemoryStore::new())))
        }
    }
}

/// Builds the component graph, starts the background workers and returns the
/// state the HTTP handlers run against.
pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let stores = initialize_stores(config).await?;
    let retry = config.retry_policy();

    let gateway: Arc<dyn LedgerGateway> = Arc::new(HorizonGateway::new(HorizonConfig {
        horizon_url: config.horizon_url.clone(),
        network_passphrase: config.network_passphrase.clone(),
        installation_account_secret: SecretKey::new(config.installation_account_secret.clone()),
        new_account_starting_balance: config.new_account_starting_balance,
        vault_account_starting_balance: config.vault_account_starting_balance,
        poll_interval: config.stream_settings().poll_interval,
    })?);
    info!("✅ Horizon gateway initialized against {}", config.horizon_url);

    let accounts = Arc::new(BridgeAccounts::new(stores.bridges.clone()));
    let resolver = Arc::new(FederationResolver::new(
        &config.local_federation_domain,
        accounts.clone(),
    ));
    let federation = Arc::new(Federation::new(
        resolver.clone(),
        RemoteFederationClient::new(),
    ));

    // Outbound payments
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let outbox = Arc::new(PaymentOutbox::new(
        stores.outbox.clone(),
        config.payment_max_retries,
        relay_tx,
    ));
    let relay_worker = Arc::new(PaymentRelayWorker::new(
        stores.outbox.clone(),
        gateway.clone(),
        accounts.clone(),
        federation,
        retry.clone(),
    ));
    relay_worker.start(relay_rx);

    // Inbound payments
    let notifier: Arc<dyn CoreBankingNotifier> = match &config.core_banking_url {
        Some(url) => {
            info!("✅ Inbound payments will be delivered to {}", url);
            Arc::new(HttpCoreBankingNotifier::new(url.clone()))
        }
        None => {
            warn!("⚠️  CORE_BANKING_URL not set - inbound payments are only logged");
            Arc::new(LoggingNotifier)
        }
    };
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    let delivery = Arc::new(InboundDelivery::new(stores.events.clone(), delivery_tx));
    let delivery_worker = Arc::new(InboundDeliveryWorker::new(
        stores.events,
        accounts.clone(),
        notifier,
        retry,
    ));
    delivery_worker.start(delivery_rx);

    let ingestor = Arc::new(StreamIngestor::new(
        gateway.clone(),
        accounts.clone(),
        stores.cursors,
        delivery.clone(),
        config.stream_settings(),
        config.payment_max_retries,
    ));
    let subscribed = ingestor.start().await?;
    info!("✅ Ledger ingestion running for {} accounts", subscribed);

    // Re-signals whatever the signals missed, starting with leftovers from before a restart
    let targets: Vec<Arc<dyn SweepTarget>> = vec![
        outbox.clone() as Arc<dyn SweepTarget>,
        delivery as Arc<dyn SweepTarget>,
    ];
    RecoverySweeper::new(targets, config.recovery_sweep_interval()).start();

    let netting = Arc::new(VaultNettingEngine::new(accounts.clone(), gateway.clone()));
    let service = Arc::new(BridgeService::new(
        accounts, gateway, resolver, outbox, ingestor, netting,
    ));

    Ok(AppState { service })
}
