use crate::item::Action;
use crate::item::WorkItem;
use crate::key::ObjectKey;
use crate::ratelimit::RateLimiter;
use crate::ratelimit::default_controller_rate_limiter;

use log;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/*
 * Bookkeeping of the queue, always mutated under a single lock.
 *
 *  - `queue` holds the keys ready to be handed out, in order;
 *  - `dirty` holds every key that needs processing (the queued ones, and
 *    the ones re-added while a worker holds them) with the latest action;
 *  - `processing` holds the keys currently checked out by a worker;
 *  - `waiting` holds keys scheduled by add_after() and their deadline.
 *
 * A key sits in `queue` only if it is in `dirty` and not in `processing`.
 */
#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashMap<ObjectKey, Action>,
    processing: HashSet<ObjectKey>,
    waiting: HashMap<ObjectKey, Instant>,
    shutting_down: bool,
}

impl QueueState {

    /*
     * Returns true when the key was pushed to `queue` and a worker should
     * be woken up.
     */
    fn insert(&mut self, item: WorkItem) -> bool {
	if self.shutting_down {
	    return false;
	}

	if let Some(action) = self.dirty.get_mut(&item.key) {
	    // already pending, just keep the most recent hint
	    *action = item.action;
	    return false;
	}

	self.dirty.insert(item.key.clone(), item.action);
	if self.processing.contains(&item.key) {
	    return false;
	}

	self.queue.push_back(item.key);
	true
    }
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
    limiter: Box<dyn RateLimiter>,

    /* fires on shutdown, ends the add_after() sleepers */
    stopped: CancellationToken,
}

impl Inner {

    fn lock(&self) -> MutexGuard<'_, QueueState> {
	self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/*
 * EventQueue is a deduplicating, rate limited work queue keyed by object
 * identity. Every key handed out by get() must be given back through
 * done(), until then no other caller can get the same key.
 */
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {

    pub fn new(name: &str) -> Self {
	Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(name: &str, limiter: Box<dyn RateLimiter>) -> Self {
	Self{
	    inner: Arc::new(Inner{
		name: name.to_string(),
		state: Mutex::new(QueueState::default()),
		available: Notify::new(),
		limiter: limiter,
		stopped: CancellationToken::new(),
	    }),
	}
    }

    pub fn name(&self) -> &str {
	&self.inner.name
    }

    /*
     * Queue the item unless its key is already pending. A key that is
     * being processed is only marked dirty and comes back on done().
     */
    pub fn add(&self, item: WorkItem) {
	let wake = self.inner.lock().insert(item);

	if wake {
	    self.inner.available.notify_one();
	}
    }

    /*
     * Wait for the next key to process. Returns None once the queue is
     * shut down and nothing is left in it.
     */
    pub async fn get(&self) -> Option<WorkItem> {
	loop {
	    let notified = self.inner.available.notified();
	    tokio::pin!(notified);
	    // register before looking at the state, so a wake up in between is not lost
	    notified.as_mut().enable();

	    {
		let mut state = self.inner.lock();
		if let Some(key) = state.queue.pop_front() {
		    let action = state.dirty.remove(&key).unwrap_or(Action::Update);
		    state.processing.insert(key.clone());

		    return Some(WorkItem::new(action, key));
		}

		if state.shutting_down {
		    return None;
		}
	    }

	    notified.await;
	}
    }

    /*
     * Give back a key obtained from get(). If it was re-added meanwhile it
     * goes straight back into the queue.
     */
    pub fn done(&self, key: &ObjectKey) {
	let wake = {
	    let mut state = self.inner.lock();
	    state.processing.remove(key);

	    if state.dirty.contains_key(key) {
		state.queue.push_back(key.clone());
		true
	    } else {
		false
	    }
	};

	if wake {
	    self.inner.available.notify_one();
	}
    }

    /*
     * Add the item once `delay` has elapsed. When the key is already
     * waiting the earliest deadline wins.
     */
    pub fn add_after(&self, item: WorkItem, delay: Duration) {
	if delay.is_zero() {
	    return self.add(item);
	}

	let deadline = Instant::now() + delay;
	{
	    let mut state = self.inner.lock();
	    if state.shutting_down {
		return;
	    }

	    match state.waiting.get(&item.key) {
		Some(scheduled) if *scheduled <= deadline => return,
		_ => {
		    state.waiting.insert(item.key.clone(), deadline);
		},
	    }
	}

	let queue = self.clone();
	tokio::spawn(async move {
	    tokio::select! {
		_ = queue.inner.stopped.cancelled() => return,
		_ = tokio::time::sleep_until(deadline) => {},
	    }

	    let wake = {
		let mut state = queue.inner.lock();
		// a later call may have moved the deadline earlier
		if state.waiting.get(&item.key) != Some(&deadline) {
		    return;
		}
		state.waiting.remove(&item.key);
		state.insert(item)
	    };

	    if wake {
		queue.inner.available.notify_one();
	    }
	});
    }

    /*
     * Add the item after the backoff computed by the rate limiter. Used
     * when processing of the key failed.
     */
    pub fn add_rate_limited(&self, item: WorkItem) {
	let delay = self.inner.limiter.when(&item.key);

	log::debug!("{}: requeueing {} in {:?}", self.inner.name, item, delay);
	self.add_after(item, delay);
    }

    /*
     * Reset the backoff of a key, normally after it was processed
     * successfully.
     */
    pub fn forget(&self, key: &ObjectKey) {
	self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
	self.inner.limiter.num_requeues(key)
    }

    /* Number of keys ready to be handed out. */
    pub fn len(&self) -> usize {
	self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
	self.len() == 0
    }

    /* Whether a delayed add is pending for the key. */
    pub fn is_waiting(&self, key: &ObjectKey) -> bool {
	self.inner.lock().waiting.contains_key(key)
    }

    /*
     * Stop accepting new items. Workers keep getting what is already
     * queued and then see None.
     */
    pub fn shutdown(&self) {
	{
	    let mut state = self.inner.lock();
	    state.shutting_down = true;
	    state.waiting.clear();
	}

	self.inner.stopped.cancel();
	self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
	self.inner.lock().shutting_down
    }
}
