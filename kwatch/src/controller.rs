use crate::errors::Error;
use crate::item::Action;
use crate::item::WorkItem;
use crate::key::meta_namespace_key;
use crate::queue::EventQueue;
use crate::ratelimit::BucketRateLimiter;
use crate::ratelimit::ItemExponentialFailureRateLimiter;
use crate::ratelimit::MaxOfRateLimiter;
use crate::reconcile::Outcome;
use crate::reconcile::Reconciler;
use crate::source::EventHandler;
use crate::source::NotificationSource;

use futures::FutureExt;
use kube::Resource;
use log;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CACHE_SYNC_POLL_PERIOD: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ControllerConfig {

    /* number of concurrent reconcile workers, at least one */
    pub workers: usize,

    /* how long run() waits for the source cache before giving up */
    pub cache_sync_timeout: Duration,

    /*
     * Failed keys are dropped once they've been requeued this many times.
     * None retries forever.
     */
    pub max_retries: Option<u32>,

    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
	Self{
	    workers: 2,
	    cache_sync_timeout: Duration::from_secs(120),
	    max_retries: None,

	    base_delay: crate::ratelimit::DEFAULT_BASE_DELAY,
	    max_delay: crate::ratelimit::DEFAULT_MAX_DELAY,
	    qps: crate::ratelimit::DEFAULT_QPS,
	    burst: crate::ratelimit::DEFAULT_BURST,
	}
    }
}

/*
 * The bridge between a notification source and the queue: every
 * notification becomes the key of the object it is about.
 */
struct QueueHandler {
    queue: EventQueue,
}

impl QueueHandler {

    fn enqueue<K: Resource>(&self, action: Action, obj: &K) {
	let key = match meta_namespace_key(obj) {
	    Ok(key) => key,
	    Err(err) => {
		log::error!("{}: dropping {} notification: {}", self.queue.name(), action, err);
		return;
	    }
	};

	log::debug!("{}: enqueue {} {}", self.queue.name(), action, key);
	self.queue.add(WorkItem::new(action, key));
    }
}

impl<K: Resource> EventHandler<K> for QueueHandler {

    fn on_add(&self, obj: &K) {
	self.enqueue(Action::Add, obj);
    }

    fn on_update(&self, _old: &K, new: &K) {
	self.enqueue(Action::Update, new);
    }

    fn on_delete(&self, obj: &K) {
	self.enqueue(Action::Delete, obj);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
	return msg.to_string();
    }
    match panic.downcast::<String>() {
	Ok(msg) => *msg,
	Err(_) => String::from("unknown panic"),
    }
}

/*
 * Process one item. Returns false once the queue is shut down and empty.
 */
async fn process_next_item<R: Reconciler>(queue: &EventQueue, reconciler: &R, max_retries: Option<u32>) -> bool {
    let item = match queue.get().await {
	Some(item) => item,
	None => return false,
    };

    log::debug!("{}: processing {}", queue.name(), item);
    let result = AssertUnwindSafe(reconciler.reconcile(&item))
	.catch_unwind()
	.await
	.unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic))));

    match result {
	Ok(Outcome::Synced) => {
	    log::debug!("{}: successfully synced {}", queue.name(), item.key);
	    queue.forget(&item.key);
	},
	Ok(Outcome::NotFound) => {
	    log::debug!("{}: {} no longer exists, nothing to do", queue.name(), item.key);
	    queue.forget(&item.key);
	},
	Ok(Outcome::RequeueAfter(delay)) => {
	    log::debug!("{}: synced {}, checking again in {:?}", queue.name(), item.key, delay);
	    queue.forget(&item.key);
	    queue.add_after(item.clone(), delay);
	},
	Err(err) => {
	    let retries = queue.num_requeues(&item.key);
	    match max_retries {
		Some(max) if retries >= max => {
		    log::error!("{}: giving up on {} after {} retries: {}", queue.name(), item.key, retries, err);
		    queue.forget(&item.key);
		},
		_ => {
		    log::warn!("{}: error syncing {}, requeueing: {}", queue.name(), item.key, err);
		    queue.add_rate_limited(item.clone());
		},
	    }
	},
    }

    queue.done(&item.key);
    true
}

/*
 * Body of a worker: keep processing until the queue shuts down.
 */
pub async fn worker_loop<R: Reconciler>(queue: EventQueue, reconciler: Arc<R>, max_retries: Option<u32>) {
    while process_next_item(&queue, reconciler.as_ref(), max_retries).await {}
}

/*
 * Controller wires a notification source to a pool of reconcile workers
 * through an EventQueue.
 */
pub struct Controller<K, S, R>
where
    S: NotificationSource<K>,
    R: Reconciler,
{
    source: Arc<S>,
    queue: EventQueue,
    reconciler: Arc<R>,
    config: ControllerConfig,
    _kind: PhantomData<fn(K)>,
}

impl<K, S, R> Controller<K, S, R>
where
    K: Resource + 'static,
    S: NotificationSource<K>,
    R: Reconciler,
{

    /*
     * Build the controller and subscribe its queue to the source. The
     * source should not deliver anything before this call.
     */
    pub fn new(name: &str, source: Arc<S>, reconciler: Arc<R>, config: ControllerConfig) -> Self {
	let limiter = MaxOfRateLimiter::new(vec![
	    Box::new(ItemExponentialFailureRateLimiter::new(config.base_delay, config.max_delay)),
	    Box::new(BucketRateLimiter::new(config.qps, config.burst)),
	]);
	let queue = EventQueue::with_rate_limiter(name, Box::new(limiter));

	log::info!("Setting up event handlers for {}", name);
	source.subscribe(Arc::new(QueueHandler{
	    queue: queue.clone(),
	}));

	Self{
	    source: source,
	    queue: queue,
	    reconciler: reconciler,
	    config: config,
	    _kind: PhantomData,
	}
    }

    pub fn queue(&self) -> &EventQueue {
	&self.queue
    }

    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> Result<(), Error> {
	let synced = async {
	    let mut poll = tokio::time::interval(CACHE_SYNC_POLL_PERIOD);
	    while !self.source.has_synced() {
		poll.tick().await;
	    }
	};

	tokio::select! {
	    _ = cancel.cancelled() => Err(Error::CacheSync(String::from("cancelled while waiting"))),
	    res = tokio::time::timeout(self.config.cache_sync_timeout, synced) => match res {
		Ok(()) => Ok(()),
		Err(_) => Err(Error::CacheSync(format!("timed out after {:?}", self.config.cache_sync_timeout))),
	    },
	}
    }

    /*
     * Wait for the cache to sync, then run the workers until `cancel`
     * fires. Returns once every worker has drained the queue and exited.
     * Only startup problems are reported as errors, failures of single
     * items are retried by the workers.
     */
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
	let name = self.queue.name();

	if self.config.workers == 0 {
	    self.queue.shutdown();
	    return Err(Error::Config(String::from("at least one worker is required")));
	}

	log::info!("Starting {} controller", name);
	log::info!("Waiting for informer caches to sync");
	if let Err(err) = self.wait_for_cache_sync(&cancel).await {
	    log::error!("{}: {}", name, err);
	    self.queue.shutdown();
	    return Err(err);
	}
	log::info!("Caches are synced");

	log::info!("Starting {} workers", self.config.workers);
	let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
	    .map(|_| tokio::spawn(worker_loop(self.queue.clone(), self.reconciler.clone(), self.config.max_retries)))
	    .collect();
	log::info!("Started workers");

	cancel.cancelled().await;
	log::info!("Shutting down workers");
	self.queue.shutdown();

	for worker in workers {
	    if let Err(err) = worker.await {
		log::error!("{}: worker exited abnormally: {}", name, err);
	    }
	}
	log::info!("All {} workers stopped", name);

	Ok(())
    }
}
