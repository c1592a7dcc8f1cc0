//! MulticallService
//!
//! Owned context tying the listener registry, result cache and batch scheduler
//! together. Clone it freely; clones share state. All bookkeeping happens under
//! one mutex that is never held across an `.await`, so ordering guarantees
//! (monotonic block numbers, single in-flight request per call and block) hold
//! even with batches completing concurrently on a multi-threaded runtime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::aggregator::Aggregator;
use super::cache::{CallState, ResultCache};
use super::call::Call;
use super::listeners::{ListenerOptions, ListenerRegistry};
use super::scheduler::{apply_response, Batch, BatchReport, BatchScheduler};
use super::ChainId;

/// Tunables for the service. Batch size depends on the aggregator contract's
/// calldata limits; cadence is a per-consumer default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticallConfig {
    /// Maximum calls per aggregated request
    pub max_batch_size: usize,
    /// Cadence used by `subscribe_default`
    pub default_blocks_per_fetch: u64,
    /// Run a cache sweep every N processed blocks (0 disables)
    pub sweep_interval_blocks: u64,
}

impl Default for MulticallConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            default_blocks_per_fetch: 1,
            sweep_interval_blocks: 25,
        }
    }
}

struct State {
    listeners: ListenerRegistry,
    cache: ResultCache,
    scheduler: BatchScheduler,
    torn_down: bool,
}

struct Shared {
    config: MulticallConfig,
    aggregator: Arc<dyn Aggregator>,
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent between statements, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct MulticallService {
    shared: Arc<Shared>,
}

impl MulticallService {
    pub fn new(config: MulticallConfig, aggregator: Arc<dyn Aggregator>) -> Self {
        let state = State {
            listeners: ListenerRegistry::new(),
            cache: ResultCache::new(),
            scheduler: BatchScheduler::new(config.max_batch_size),
            torn_down: false,
        };

        Self {
            shared: Arc::new(Shared {
                config,
                aggregator,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &MulticallConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    // ========== Listener Registry ==========

    pub fn add_listeners(&self, chain_id: ChainId, calls: &[Call], options: ListenerOptions) {
        let mut state = self.lock();
        if state.torn_down {
            return;
        }
        state.listeners.add_listeners(chain_id, calls, options);
    }

    pub fn remove_listeners(&self, chain_id: ChainId, calls: &[Call], options: ListenerOptions) {
        self.lock().listeners.remove_listeners(chain_id, calls, options);
    }

    /// Register calls for as long as the returned [`Subscription`] is alive.
    ///
    /// Calls subscribed after the current block was planned are first fetched
    /// on the next block; until then they read as idle, not loading.
    pub fn subscribe(
        &self,
        chain_id: ChainId,
        calls: Vec<Call>,
        options: ListenerOptions,
    ) -> Subscription {
        self.add_listeners(chain_id, &calls, options);
        Subscription {
            shared: Arc::downgrade(&self.shared),
            chain_id,
            calls,
            options,
        }
    }

    pub fn subscribe_default(&self, chain_id: ChainId, calls: Vec<Call>) -> Subscription {
        let options = ListenerOptions::every(self.shared.config.default_blocks_per_fetch);
        self.subscribe(chain_id, calls, options)
    }

    pub fn is_listening(&self, chain_id: ChainId, call: &Call) -> bool {
        self.lock().listeners.is_listening(chain_id, call)
    }

    // ========== Result Cache ==========

    /// Current snapshot for a call. Never blocks on I/O and never fails.
    pub fn get_call_result(&self, chain_id: ChainId, call: &Call) -> CallState {
        self.lock().cache.read(chain_id, call)
    }

    pub fn get_call_results(&self, chain_id: ChainId, calls: &[Call]) -> Vec<CallState> {
        let state = self.lock();
        calls.iter().map(|call| state.cache.read(chain_id, call)).collect()
    }

    /// Evict cache entries nobody listens to
    pub fn sweep(&self, chain_id: ChainId) -> usize {
        let mut state = self.lock();
        let State { listeners, cache, .. } = &mut *state;
        let evicted = cache.sweep(chain_id, listeners);
        if evicted > 0 {
            debug!("🧹 Swept {} unused cache entries on chain {}", evicted, chain_id);
        }
        evicted
    }

    pub fn cached_entries(&self, chain_id: ChainId) -> usize {
        self.lock().cache.len(chain_id)
    }

    // ========== Batch Scheduler ==========

    pub fn latest_block(&self, chain_id: ChainId) -> Option<u64> {
        self.lock().scheduler.latest_block(chain_id)
    }

    /// Select and mark the calls due at `block`. Heights that do not advance
    /// the chain produce no batches.
    pub fn plan_block(&self, chain_id: ChainId, block: u64) -> Vec<Batch> {
        let mut state = self.lock();
        if state.torn_down {
            return Vec::new();
        }
        if !state.scheduler.observe_block(chain_id, block) {
            trace!("Ignoring non-advancing block {} on chain {}", block, chain_id);
            return Vec::new();
        }

        let State { listeners, cache, scheduler, .. } = &mut *state;
        let batches = scheduler.plan(listeners, cache, chain_id, block);

        if !batches.is_empty() {
            debug!(
                "📦 Block {}: {} due calls in {} batches (chain {})",
                block,
                batches.iter().map(|b| b.calls.len()).sum::<usize>(),
                batches.len(),
                chain_id
            );
        }
        batches
    }

    /// Send one batch to the aggregator and fold the response into the cache
    pub async fn execute(&self, batch: Batch) -> BatchReport {
        let response = self
            .shared
            .aggregator
            .aggregate(batch.chain_id, batch.block, &batch.calls)
            .await;

        if let Err(e) = &response {
            warn!(
                "Batch of {} calls at block {} failed: {}",
                batch.calls.len(),
                batch.block,
                e
            );
        }

        let mut state = self.lock();
        if state.torn_down {
            return BatchReport::default();
        }
        let report = apply_response(&mut state.cache, &batch, &response);

        trace!(
            "Block {}: {} updated, {} failed, {} superseded",
            batch.block,
            report.updated,
            report.failed,
            report.superseded
        );
        report
    }

    /// Plan `block` and issue every batch as its own task
    pub fn on_new_block(&self, chain_id: ChainId, block: u64) -> Vec<JoinHandle<BatchReport>> {
        self.plan_block(chain_id, block)
            .into_iter()
            .map(|batch| {
                let service = self.clone();
                tokio::spawn(async move { service.execute(batch).await })
            })
            .collect()
    }

    /// Drive the scheduler from a block-height channel until the channel
    /// closes or the service is torn down.
    pub async fn run(&self, chain_id: ChainId, mut blocks: watch::Receiver<u64>) {
        let sweep_every = self.shared.config.sweep_interval_blocks;
        let mut since_sweep = 0u64;

        info!("🔁 Multicall scheduler running on chain {}", chain_id);

        loop {
            if blocks.changed().await.is_err() {
                info!("Block source closed, scheduler stopping");
                return;
            }
            if self.is_torn_down() {
                info!("Service torn down, scheduler stopping");
                return;
            }

            let block = *blocks.borrow_and_update();
            // Batches complete on their own tasks
            drop(self.on_new_block(chain_id, block));

            since_sweep += 1;
            if sweep_every > 0 && since_sweep >= sweep_every {
                self.sweep(chain_id);
                since_sweep = 0;
            }
        }
    }

    // ========== Lifecycle ==========

    /// Drop all listeners and cached results. Later calls become no-ops.
    pub fn teardown(&self) {
        let mut state = self.lock();
        state.torn_down = true;
        state.listeners.clear();
        state.cache.clear();
        info!("Multicall service torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }
}

/// Scoped listener registration. Dropping it removes exactly the
/// requirements it added, however the owner goes away.
pub struct Subscription {
    shared: Weak<Shared>,
    chain_id: ChainId,
    calls: Vec<Call>,
    options: ListenerOptions,
}

impl Subscription {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn options(&self) -> ListenerOptions {
        self.options
    }

    /// Current state of every subscribed call, in subscription order
    pub fn states(&self) -> Vec<CallState> {
        match self.shared.upgrade() {
            Some(shared) => {
                let state = shared.lock();
                self.calls
                    .iter()
                    .map(|call| state.cache.read(self.chain_id, call))
                    .collect()
            }
            None => vec![CallState::default(); self.calls.len()],
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .lock()
                .listeners
                .remove_listeners(self.chain_id, &self.calls, self.options);
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicall::aggregator::CallOutcome;
    use alloy_primitives::{bytes, Bytes, U256};
    use eyre::{eyre, Result};
    use futures::future::{join_all, BoxFuture};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const CHAIN: ChainId = 1;

    /// Answers from a fixed table; unknown calls fail individually
    #[derive(Default)]
    struct MockAggregator {
        values: Mutex<HashMap<Call, Bytes>>,
        fail_batches: AtomicBool,
        requests: Mutex<Vec<(u64, usize)>>,
    }

    impl MockAggregator {
        fn set(&self, call: &Call, value: Bytes) {
            self.values.lock().unwrap().insert(call.clone(), value);
        }

        fn requests(&self) -> Vec<(u64, usize)> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Aggregator for MockAggregator {
        fn aggregate<'a>(
            &'a self,
            _chain_id: ChainId,
            block: u64,
            calls: &'a [Call],
        ) -> BoxFuture<'a, Result<Vec<CallOutcome>>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push((block, calls.len()));
                if self.fail_batches.load(Ordering::SeqCst) {
                    return Err(eyre!("rpc unavailable"));
                }
                let values = self.values.lock().unwrap();
                Ok(calls
                    .iter()
                    .map(|call| match values.get(call) {
                        Some(value) => CallOutcome::Success(value.clone()),
                        None => CallOutcome::Failure,
                    })
                    .collect())
            })
        }
    }

    fn balance_of(account: u64) -> Call {
        Call::new(
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            "balanceOf(address)",
            vec![U256::from(account)],
        )
        .unwrap()
    }

    fn setup(config: MulticallConfig) -> (MulticallService, Arc<MockAggregator>) {
        let aggregator = Arc::new(MockAggregator::default());
        let service = MulticallService::new(config, aggregator.clone());
        (service, aggregator)
    }

    async fn process(service: &MulticallService, block: u64) -> Vec<BatchReport> {
        join_all(service.on_new_block(CHAIN, block))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_first_fetch_populates_cache() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("64"));

        let sub = service.subscribe(CHAIN, vec![call.clone()], ListenerOptions::every(1));
        process(&service, 100).await;

        let state = service.get_call_result(CHAIN, &call);
        assert_eq!(state.result, Some(bytes!("64")));
        assert_eq!(state.block_number, Some(100));
        assert!(!state.error);
        assert!(!state.is_loading);
        assert_eq!(sub.states(), vec![state]);
    }

    #[tokio::test]
    async fn test_effective_cadence_after_unmount() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("64"));

        let fast = service.subscribe(CHAIN, vec![call.clone()], ListenerOptions::every(1));
        let _slow = service.subscribe(CHAIN, vec![call.clone()], ListenerOptions::every(5));
        process(&service, 100).await;
        assert_eq!(aggregator.requests().len(), 1);

        drop(fast);
        assert!(service.is_listening(CHAIN, &call));

        for block in 101..105 {
            process(&service, block).await;
        }
        assert_eq!(aggregator.requests().len(), 1);

        process(&service, 105).await;
        assert_eq!(aggregator.requests(), vec![(100, 1), (105, 1)]);
    }

    #[tokio::test]
    async fn test_explicit_add_and_remove_listeners() {
        let (service, _) = setup(MulticallConfig::default());
        let (call, other) = (balance_of(1), balance_of(2));

        service.add_listeners(CHAIN, &[call.clone()], ListenerOptions::every(1));
        service.add_listeners(CHAIN, &[call.clone()], ListenerOptions::every(1));

        // Unregistered call, and unregistered cadence for a known call
        service.remove_listeners(CHAIN, &[other.clone()], ListenerOptions::every(1));
        service.remove_listeners(CHAIN, &[call.clone()], ListenerOptions::every(7));
        assert!(service.is_listening(CHAIN, &call));
        assert!(!service.is_listening(CHAIN, &other));

        service.remove_listeners(CHAIN, &[call.clone()], ListenerOptions::every(1));
        assert!(service.is_listening(CHAIN, &call));
        let planned = service.plan_block(CHAIN, 10);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].calls, vec![call.clone()]);

        service.remove_listeners(CHAIN, &[call.clone()], ListenerOptions::every(1));
        assert!(!service.is_listening(CHAIN, &call));
        assert!(service.plan_block(CHAIN, 11).is_empty());
    }

    #[tokio::test]
    async fn test_late_subscriber_waits_for_next_block() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("64"));

        process(&service, 100).await;
        let _sub = service.subscribe_default(CHAIN, vec![call.clone()]);

        // Same height again plans nothing, the call reads idle
        assert!(service.on_new_block(CHAIN, 100).is_empty());
        let idle = service.get_call_result(CHAIN, &call);
        assert!(!idle.is_loading);
        assert_eq!(idle.result, None);

        process(&service, 101).await;
        assert_eq!(service.get_call_result(CHAIN, &call).result, Some(bytes!("64")));
    }

    #[tokio::test]
    async fn test_reference_counted_subscriptions() {
        let (service, _) = setup(MulticallConfig::default());
        let call = balance_of(1);

        let a = service.subscribe_default(CHAIN, vec![call.clone()]);
        let b = service.subscribe_default(CHAIN, vec![call.clone()]);

        drop(a);
        assert!(service.is_listening(CHAIN, &call));
        drop(b);
        assert!(!service.is_listening(CHAIN, &call));
        assert!(service.plan_block(CHAIN, 1).is_empty());
    }

    #[tokio::test]
    async fn test_failure_keeps_stale_result_and_retries() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("64"));
        let _sub = service.subscribe_default(CHAIN, vec![call.clone()]);

        process(&service, 100).await;

        aggregator.fail_batches.store(true, Ordering::SeqCst);
        let reports = process(&service, 101).await;
        assert_eq!(reports[0].failed, 1);

        let state = service.get_call_result(CHAIN, &call);
        assert_eq!(state.result, Some(bytes!("64")));
        assert_eq!(state.block_number, Some(100));
        assert!(state.error);

        // Scheduler keeps going and retries on the next block
        aggregator.fail_batches.store(false, Ordering::SeqCst);
        aggregator.set(&call, bytes!("65"));
        process(&service, 102).await;

        let state = service.get_call_result(CHAIN, &call);
        assert_eq!(state.result, Some(bytes!("65")));
        assert_eq!(state.block_number, Some(102));
        assert!(!state.error);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        let _sub = service.subscribe_default(CHAIN, vec![call.clone()]);

        let old = service.plan_block(CHAIN, 99);
        let new = service.plan_block(CHAIN, 100);
        assert_eq!((old.len(), new.len()), (1, 1));

        aggregator.set(&call, bytes!("02"));
        service.execute(new[0].clone()).await;

        aggregator.set(&call, bytes!("01"));
        let report = service.execute(old[0].clone()).await;
        assert_eq!(report.superseded, 1);

        let state = service.get_call_result(CHAIN, &call);
        assert_eq!(state.block_number, Some(100));
        assert_eq!(state.result, Some(bytes!("02")));
    }

    #[tokio::test]
    async fn test_stale_while_revalidate() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("64"));
        let _sub = service.subscribe_default(CHAIN, vec![call.clone()]);

        let first = service.plan_block(CHAIN, 100);
        assert!(service.get_call_result(CHAIN, &call).is_loading);
        service.execute(first[0].clone()).await;

        let refresh = service.plan_block(CHAIN, 101);
        assert_eq!(refresh.len(), 1);
        let state = service.get_call_result(CHAIN, &call);
        assert!(!state.is_loading);
        assert!(state.is_syncing);
        assert_eq!(state.result, Some(bytes!("64")));

        // Duplicate due-check for the same block issues nothing
        assert!(service.plan_block(CHAIN, 101).is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_bound() {
        let config = MulticallConfig { max_batch_size: 2, ..MulticallConfig::default() };
        let (service, _) = setup(config);
        let calls: Vec<Call> = (0..5).map(balance_of).collect();
        let _sub = service.subscribe_default(CHAIN, calls);

        let reports = process(&service, 1).await;
        assert_eq!(reports.len(), 3);
        // Nothing in the table, every call fails individually
        assert_eq!(reports.iter().map(|r| r.failed).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_unlistened() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let (kept, dropped) = (balance_of(1), balance_of(2));
        aggregator.set(&kept, bytes!("01"));
        aggregator.set(&dropped, bytes!("02"));

        let _keep = service.subscribe_default(CHAIN, vec![kept.clone()]);
        let gone = service.subscribe_default(CHAIN, vec![dropped.clone()]);
        process(&service, 1).await;
        assert_eq!(service.cached_entries(CHAIN), 2);

        drop(gone);
        assert_eq!(service.sweep(CHAIN), 1);
        assert_eq!(service.get_call_result(CHAIN, &kept).result, Some(bytes!("01")));
        assert_eq!(service.get_call_result(CHAIN, &dropped), CallState::default());
    }

    #[tokio::test]
    async fn test_teardown() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("01"));
        let sub = service.subscribe_default(CHAIN, vec![call.clone()]);
        process(&service, 1).await;

        service.teardown();
        assert!(service.is_torn_down());
        assert_eq!(service.get_call_result(CHAIN, &call), CallState::default());
        assert!(service.on_new_block(CHAIN, 2).is_empty());

        drop(sub);
        let late = service.subscribe_default(CHAIN, vec![call.clone()]);
        assert!(!service.is_listening(CHAIN, &call));
        drop(late);
    }

    #[tokio::test]
    async fn test_subscription_outliving_service() {
        let (service, _) = setup(MulticallConfig::default());
        let sub = service.subscribe_default(CHAIN, vec![balance_of(1)]);
        drop(service);

        assert_eq!(sub.states(), vec![CallState::default()]);
        drop(sub);
    }

    #[tokio::test]
    async fn test_run_follows_block_channel() {
        let (service, aggregator) = setup(MulticallConfig::default());
        let call = balance_of(1);
        aggregator.set(&call, bytes!("64"));
        let _sub = service.subscribe_default(CHAIN, vec![call.clone()]);

        let (tx, rx) = watch::channel(0u64);
        let runner = tokio::spawn({
            let service = service.clone();
            async move { service.run(CHAIN, rx).await }
        });

        tx.send(100).unwrap();
        let mut state = CallState::default();
        for _ in 0..100 {
            state = service.get_call_result(CHAIN, &call);
            if state.result.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.result, Some(bytes!("64")));
        assert_eq!(service.latest_block(CHAIN), Some(100));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
