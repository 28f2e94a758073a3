#![allow(dead_code)]

use patronpay::{
    BillingConfig, Creator, LedgerOp, LedgerStore, MemoryLedger, NullSink, ReconciliationEngine,
    RenewalWorker, TxHash, User,
};
use std::sync::Arc;

pub fn hash(byte: char) -> TxHash {
    TxHash::parse(&byte.to_string().repeat(64)).unwrap()
}

pub struct World {
    pub store: Arc<MemoryLedger>,
    pub engine: Arc<ReconciliationEngine>,
    pub worker: RenewalWorker,
    pub subscriber: User,
    pub creator_user: User,
    pub creator: Creator,
}

/// One subscriber, one creator, default 2% fee config.
pub async fn world() -> World {
    let store = Arc::new(MemoryLedger::new());
    let subscriber = User::new("GSUBSCRIBER", "Sam");
    let creator_user = User::new("GCREATOR", "Casey");
    let creator = Creator::new(&creator_user);
    store
        .commit(vec![
            LedgerOp::InsertUser(subscriber.clone()),
            LedgerOp::InsertUser(creator_user.clone()),
            LedgerOp::InsertCreator(creator.clone()),
        ])
        .await
        .unwrap();

    let config = BillingConfig::default();
    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        Arc::new(NullSink),
        config.clone(),
    ));
    let worker = RenewalWorker::new(store.clone(), Arc::new(NullSink), config);

    World {
        store,
        engine,
        worker,
        subscriber,
        creator_user,
        creator,
    }
}
