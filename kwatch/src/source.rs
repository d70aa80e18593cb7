use crate::errors::Error;
use crate::key::ObjectKey;
use crate::key::meta_namespace_key;

use futures::StreamExt;
use kube::Api as KubeApi;
use kube::Resource;
use kube::runtime::WatchStreamExt;
use kube::runtime::reflector as kube_reflector;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::reflector::Store;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher as kube_watcher;
use kube::runtime::watcher::Event as WatchEvent;
use log;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

/*
 * Callbacks invoked for every change observed on the watched objects.
 * They may run concurrently with anything else, so they should only
 * hand the change over (typically to an EventQueue) and return.
 */
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

/*
 * A source of change notifications backed by a local cache of the
 * watched objects.
 */
pub trait NotificationSource<K>: Send + Sync + 'static {

    /* Register a handler, expected to happen once before the source starts. */
    fn subscribe(&self, handler: Arc<dyn EventHandler<K>>);

    /* Whether the cache has been filled by a complete listing. */
    fn has_synced(&self) -> bool;

    /* Current cached state of the object behind `key`, if any. */
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, Error>;
}

/*
 * The cache half of a KubeSource: a reflector store plus the subscribed
 * handlers. Watch events go through apply(), which updates the store and
 * tells the handlers what changed compared to the previous contents.
 */
pub struct SharedCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    reader: Store<K>,
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    synced: AtomicBool,
}

/*
 * A listing in progress: what it returned so far, and the notifications
 * to send once the store has switched over to it.
 */
pub struct Listing<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<(Option<Arc<K>>, K)>,
}

impl<K> Listing<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{

    pub fn new() -> Self {
	Self{
	    seen: HashSet::new(),
	    pending: Vec::new(),
	}
    }

    fn clear(&mut self) {
	self.seen.clear();
	self.pending.clear();
    }
}

impl<K> Default for Listing<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn default() -> Self {
	Self::new()
    }
}

fn describe<K: Resource>(obj: &K) -> String {
    match meta_namespace_key(obj) {
	Ok(key) => key.to_string(),
	Err(_) => String::from("<unnamed>"),
    }
}

fn kind<K: Resource>() -> String
where
    K::DynamicType: Default,
{
    K::kind(&K::DynamicType::default()).to_string()
}

impl<K> SharedCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{

    pub fn new(reader: Store<K>) -> Self {
	Self{
	    reader: reader,
	    handlers: RwLock::new(Vec::new()),
	    synced: AtomicBool::new(false),
	}
    }

    pub fn store(&self) -> Store<K> {
	self.reader.clone()
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<K>>> {
	self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /*
     * Push one watch event into the store and notify the handlers.
     *
     * The store only swaps in a listing once it completes, so changes
     * seen during a listing are held in `listing` and reported at
     * InitDone, followed by deletes for anything no longer listed.
     */
    pub fn apply(&self, writer: &mut Writer<K>, listing: &mut Listing<K>, event: WatchEvent<K>) {
	let handlers = self.handlers();

	match &event {
	    WatchEvent::Init => {
		log::debug!("Listing {}", kind::<K>());
		listing.clear();
		writer.apply_watcher_event(&event);
	    },

	    WatchEvent::InitApply(obj) => {
		let objref = ObjectRef::from_obj(obj);
		let old = self.reader.get(&objref);
		writer.apply_watcher_event(&event);

		log::debug!("Listed {}", describe(obj));
		listing.seen.insert(objref);
		listing.pending.push((old, obj.clone()));
	    },

	    WatchEvent::Apply(obj) => {
		let old = self.reader.get(&ObjectRef::from_obj(obj));
		writer.apply_watcher_event(&event);

		log::debug!("Received an update for {}", describe(obj));
		for handler in &handlers {
		    match &old {
			Some(old) => handler.on_update(old, obj),
			None => handler.on_add(obj),
		    }
		}
	    },

	    WatchEvent::InitDone => {
		let vanished: Vec<Arc<K>> = self.reader.state()
		    .into_iter()
		    .filter(|obj| !listing.seen.contains(&ObjectRef::from_obj(obj.as_ref())))
		    .collect();
		writer.apply_watcher_event(&event);

		for (old, obj) in listing.pending.drain(..) {
		    for handler in &handlers {
			match &old {
			    Some(old) => handler.on_update(old, &obj),
			    None => handler.on_add(&obj),
			}
		    }
		}
		listing.clear();

		for obj in &vanished {
		    log::debug!("{} vanished while the watch was down", describe(obj.as_ref()));
		    for handler in &handlers {
			handler.on_delete(obj);
		    }
		}

		if !self.synced.swap(true, Ordering::SeqCst) {
		    log::info!("Cache for {} is synced", kind::<K>());
		}
	    },

	    WatchEvent::Delete(obj) => {
		writer.apply_watcher_event(&event);

		log::debug!("Received a delete for {}", describe(obj));
		for handler in &handlers {
		    handler.on_delete(obj);
		}
	    },
	}
    }

    /* Replay every cached object as an update. */
    pub fn resync(&self) {
	let handlers = self.handlers();
	let objects = self.reader.state();

	log::debug!("Resyncing {} cached {} objects", objects.len(), kind::<K>());
	for obj in &objects {
	    for handler in &handlers {
		handler.on_update(obj, obj);
	    }
	}
    }
}

impl<K> NotificationSource<K> for SharedCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{

    fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) {
	self.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    fn has_synced(&self) -> bool {
	self.synced.load(Ordering::SeqCst)
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, Error> {
	let objref = match &key.namespace {
	    Some(namespace) => ObjectRef::new(&key.name).within(namespace),
	    None => ObjectRef::new(&key.name),
	};

	Ok(self.reader.get(&objref))
    }
}

/*
 * KubeSource watches a kubernetes resource and keeps a local cache of
 * it, notifying subscribers of adds, updates and deletes the way a shared
 * informer does, including a periodic resync of the whole cache.
 */
pub struct KubeSource<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    api: KubeApi<K>,
    watcher_config: kube_watcher::Config,
    resync_period: Option<Duration>,

    cache: SharedCache<K>,
    writer: Mutex<Option<Writer<K>>>,
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
	Some(interval) => {
	    interval.tick().await;
	},
	None => std::future::pending().await,
    }
}

impl<K> KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{

    pub fn new(api: KubeApi<K>, watcher_config: kube_watcher::Config, resync_period: Option<Duration>) -> Self {
	let (reader, writer) = kube_reflector::store();

	Self{
	    api: api,
	    watcher_config: watcher_config,
	    resync_period: resync_period.filter(|period| !period.is_zero()),

	    cache: SharedCache::new(reader),
	    writer: Mutex::new(Some(writer)),
	}
    }

    /* Read-only handle on the cache. */
    pub fn store(&self) -> Store<K> {
	self.cache.store()
    }

    /*
     * Drive the watch until `cancel` fires. Watch errors are logged and
     * retried with backoff. Can only be run once.
     */
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
	let taken = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
	let mut writer = match taken {
	    Some(writer) => writer,
	    None => return Err(Error::Other(String::from("notification source is already running"))),
	};

	let mut stream = pin!(kube_watcher(self.api.clone(), self.watcher_config.clone()).default_backoff());
	let mut resync = self.resync_period
	    .map(|period| tokio::time::interval_at(Instant::now() + period, period));
	let mut listing = Listing::new();

	log::info!("Starting watch for {}", kind::<K>());
	loop {
	    tokio::select! {
		_ = cancel.cancelled() => break,

		_ = tick(&mut resync) => self.cache.resync(),

		event = stream.next() => match event {
		    Some(Ok(event)) => self.cache.apply(&mut writer, &mut listing, event),
		    Some(Err(err)) => log::warn!("Watch for {} failed, retrying: {}", kind::<K>(), err),
		    None => {
			log::warn!("Watch stream for {} ended", kind::<K>());
			break;
		    },
		},
	    }
	}
	log::info!("Stopped watch for {}", kind::<K>());

	Ok(())
    }
}

impl<K> NotificationSource<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{

    fn subscribe(&self, handler: Arc<dyn EventHandler<K>>) {
	self.cache.subscribe(handler);
    }

    fn has_synced(&self) -> bool {
	self.cache.has_synced()
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, Error> {
	self.cache.get_by_key(key)
    }
}
