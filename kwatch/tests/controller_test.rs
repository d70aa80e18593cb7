use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kwatch::Action;
use kwatch::Controller;
use kwatch::ControllerConfig;
use kwatch::Error;
use kwatch::EventHandler;
use kwatch::NotificationSource;
use kwatch::ObjectKey;
use kwatch::Outcome;
use kwatch::Reconciler;
use kwatch::WorkItem;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/*
 * In-memory notification source: the test decides what the cache holds
 * and when it is synced.
 */
#[derive(Default)]
struct FakeSource {
    objects: Mutex<BTreeMap<ObjectKey, Arc<ConfigMap>>>,
    handlers: Mutex<Vec<Arc<dyn EventHandler<ConfigMap>>>>,
    synced: AtomicBool,
}

impl FakeSource {
    fn handlers(&self) -> Vec<Arc<dyn EventHandler<ConfigMap>>> {
	self.handlers.lock().unwrap().clone()
    }

    fn apply(&self, obj: ConfigMap) {
	let old = match kwatch::key::meta_namespace_key(&obj) {
	    Ok(key) => self.objects.lock().unwrap().insert(key, Arc::new(obj.clone())),
	    Err(_) => None,
	};

	for handler in self.handlers() {
	    match &old {
		Some(old) => handler.on_update(old, &obj),
		None => handler.on_add(&obj),
	    }
	}
    }

    fn delete(&self, namespace: &str, name: &str) {
	let removed = self.objects.lock().unwrap().remove(&ObjectKey::namespaced(namespace, name));
	if let Some(obj) = removed {
	    for handler in self.handlers() {
		handler.on_delete(&obj);
	    }
	}
    }

    fn mark_synced(&self) {
	self.synced.store(true, Ordering::SeqCst);
    }
}

impl NotificationSource<ConfigMap> for FakeSource {
    fn subscribe(&self, handler: Arc<dyn EventHandler<ConfigMap>>) {
	self.handlers.lock().unwrap().push(handler);
    }

    fn has_synced(&self) -> bool {
	self.synced.load(Ordering::SeqCst)
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<ConfigMap>>, Error> {
	Ok(self.objects.lock().unwrap().get(key).cloned())
    }
}

enum Step {
    Fail,
    Panic,
    NotFound,
    Requeue(Duration),
    Wait(Arc<Notify>),
}

/*
 * Reconciler driven by a per-key script; once a key's script is empty it
 * succeeds. Records every call with the time it happened.
 */
#[derive(Default)]
struct Scripted {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(Instant, WorkItem)>>,
}

impl Scripted {
    fn script(&self, key: &str, steps: Vec<Step>) {
	self.script.lock().unwrap().insert(key.to_string(), steps.into());
    }

    fn calls_for(&self, key: &str) -> Vec<Instant> {
	self.calls.lock().unwrap()
	    .iter()
	    .filter(|(_, item)| item.key.to_string() == key)
	    .map(|(at, _)| *at)
	    .collect()
    }

    fn keys(&self) -> Vec<String> {
	self.calls.lock().unwrap().iter().map(|(_, item)| item.key.to_string()).collect()
    }

    fn count(&self) -> usize {
	self.calls.lock().unwrap().len()
    }
}

impl Reconciler for Scripted {
    async fn reconcile(&self, item: &WorkItem) -> Result<Outcome, Error> {
	self.calls.lock().unwrap().push((Instant::now(), item.clone()));

	let step = self.script.lock().unwrap()
	    .get_mut(&item.key.to_string())
	    .and_then(VecDeque::pop_front);

	match step {
	    None => Ok(Outcome::Synced),
	    Some(Step::Fail) => Err(Error::Other(format!("failed to sync {}", item.key))),
	    Some(Step::Panic) => panic!("reconcile of {} blew up", item.key),
	    Some(Step::NotFound) => Ok(Outcome::NotFound),
	    Some(Step::Requeue(delay)) => Ok(Outcome::RequeueAfter(delay)),
	    Some(Step::Wait(gate)) => {
		gate.notified().await;
		Ok(Outcome::Synced)
	    },
	}
    }
}

fn configmap(namespace: &str, name: &str) -> ConfigMap {
    ConfigMap{
	metadata: ObjectMeta{
	    name: Some(name.to_string()),
	    namespace: Some(namespace.to_string()),
	    ..ObjectMeta::default()
	},
	..ConfigMap::default()
    }
}

fn config(workers: usize) -> ControllerConfig {
    ControllerConfig{
	workers: workers,
	cache_sync_timeout: Duration::from_secs(5),
	base_delay: Duration::from_millis(5),
	max_delay: Duration::from_millis(40),
	..ControllerConfig::default()
    }
}

struct Running {
    source: Arc<FakeSource>,
    queue: kwatch::EventQueue,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), Error>>,
}

impl Running {
    async fn stop(self) -> Result<(), Error> {
	self.cancel.cancel();
	self.handle.await.unwrap()
    }
}

fn start(source: Arc<FakeSource>, reconciler: Arc<Scripted>, config: ControllerConfig) -> Running {
    let _ = env_logger::builder().is_test(true).try_init();

    let controller: Controller<ConfigMap, _, _> = Controller::new("test", source.clone(), reconciler.clone(), config);
    let queue = controller.queue().clone();
    let cancel = CancellationToken::new();

    let handle = {
	let cancel = cancel.clone();
	tokio::spawn(async move { controller.run(cancel).await })
    };

    Running{
	source: source,
	queue: queue,
	cancel: cancel,
	handle: handle,
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1000 {
	if cond() {
	    return;
	}
	tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn reconciles_every_cached_object_after_sync() {
    let source = Arc::new(FakeSource::default());
    let reconciler = Arc::new(Scripted::default());
    let running = start(source.clone(), reconciler.clone(), config(2));

    source.apply(configmap("ns", "foo"));
    source.apply(configmap("ns", "bar"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    // nothing runs before the cache is synced
    assert_eq!(reconciler.count(), 0);

    source.mark_synced();
    eventually("both objects", || reconciler.count() == 2).await;

    let mut keys = reconciler.keys();
    keys.sort();
    assert_eq!(keys, vec!["ns/bar", "ns/foo"]);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cache_sync_timeout_fails_run() {
    let source = Arc::new(FakeSource::default());
    let reconciler = Arc::new(Scripted::default());
    let running = start(source.clone(), reconciler.clone(), config(2));

    source.apply(configmap("ns", "foo"));

    let res = running.handle.await.unwrap();
    assert!(matches!(res, Err(Error::CacheSync(_))), "{res:?}");
    assert_eq!(reconciler.count(), 0);
    assert!(running.queue.is_shutting_down());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_cache_sync_fails_run() {
    let source = Arc::new(FakeSource::default());
    let reconciler = Arc::new(Scripted::default());
    let running = start(source, reconciler.clone(), config(1));

    tokio::time::sleep(Duration::from_secs(1)).await;
    let res = running.stop().await;
    assert!(matches!(res, Err(Error::CacheSync(_))), "{res:?}");
    assert_eq!(reconciler.count(), 0);
}

#[tokio::test]
async fn zero_workers_is_rejected() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());

    let res = start(source, reconciler, config(0)).handle.await.unwrap();
    assert!(matches!(res, Err(Error::Config(_))), "{res:?}");
}

#[tokio::test(start_paused = true)]
async fn not_found_is_forgotten() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    reconciler.script("ns/bar", vec![Step::Fail, Step::NotFound]);
    let running = start(source.clone(), reconciler.clone(), config(1));

    source.apply(configmap("ns", "bar"));
    eventually("two attempts", || reconciler.calls_for("ns/bar").len() == 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let key = ObjectKey::namespaced("ns", "bar");
    assert_eq!(running.queue.num_requeues(&key), 0);
    assert!(running.queue.is_empty());
    assert!(!running.queue.is_waiting(&key));
    assert_eq!(reconciler.calls_for("ns/bar").len(), 2);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_up_to_the_cap() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    reconciler.script("ns/foo", (0..5).map(|_| Step::Fail).collect());
    let running = start(source.clone(), reconciler.clone(), config(1));

    source.apply(configmap("ns", "foo"));
    eventually("recovery", || reconciler.calls_for("ns/foo").len() == 6).await;

    let calls = reconciler.calls_for("ns/foo");
    let delays: Vec<Duration> = calls.windows(2).map(|pair| pair[1] - pair[0]).collect();

    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "{delays:?}");
    assert!(delays.iter().all(|delay| *delay <= Duration::from_millis(41)), "{delays:?}");
    assert!(delays[0] >= Duration::from_millis(5), "{delays:?}");

    // success resets the backoff
    assert_eq!(running.queue.num_requeues(&ObjectKey::namespaced("ns", "foo")), 0);
    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn panicking_reconcile_does_not_kill_the_worker() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    reconciler.script("ns/foo", vec![Step::Panic]);
    let running = start(source.clone(), reconciler.clone(), config(1));

    source.apply(configmap("ns", "foo"));
    eventually("retry after panic", || reconciler.calls_for("ns/foo").len() == 2).await;

    // the single worker is still around
    source.apply(configmap("ns", "bar"));
    eventually("next key", || reconciler.calls_for("ns/bar").len() == 1).await;

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_retries() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    reconciler.script("ns/foo", (0..10).map(|_| Step::Fail).collect());
    let config = ControllerConfig{
	max_retries: Some(2),
	..config(1)
    };
    let running = start(source.clone(), reconciler.clone(), config);

    source.apply(configmap("ns", "foo"));
    eventually("three attempts", || reconciler.calls_for("ns/foo").len() == 3).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    // first attempt plus two retries, then dropped
    assert_eq!(reconciler.calls_for("ns/foo").len(), 3);
    assert_eq!(running.queue.num_requeues(&ObjectKey::namespaced("ns", "foo")), 0);
    assert!(running.queue.is_empty());

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn notifications_without_a_name_are_dropped() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    let running = start(source.clone(), reconciler.clone(), config(1));

    let mut unnamed = configmap("ns", "x");
    unnamed.metadata.name = None;
    source.apply(unnamed);
    source.apply(configmap("ns", "foo"));

    eventually("named object", || reconciler.count() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(reconciler.keys(), vec!["ns/foo"]);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn change_during_processing_is_redelivered_once() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    let gate = Arc::new(Notify::new());
    reconciler.script("ns/foo", vec![Step::Wait(gate.clone())]);
    let running = start(source.clone(), reconciler.clone(), config(2));

    source.apply(configmap("ns", "foo"));
    eventually("first attempt", || reconciler.count() == 1).await;

    // two updates while the first reconcile is still running
    source.apply(configmap("ns", "foo"));
    source.apply(configmap("ns", "foo"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    // the second worker didn't pick it up concurrently
    assert_eq!(reconciler.count(), 1);

    gate.notify_one();
    eventually("redelivery", || reconciler.count() == 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(reconciler.count(), 2);

    let calls = reconciler.calls.lock().unwrap().clone();
    assert_eq!(calls[0].1.action, Action::Add);
    assert_eq!(calls[1].1.action, Action::Update);
    drop(calls);

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn requeue_after_checks_again_later() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    reconciler.script("ns/foo", vec![Step::Requeue(Duration::from_secs(30))]);
    let running = start(source.clone(), reconciler.clone(), config(1));

    source.apply(configmap("ns", "foo"));
    eventually("first attempt", || reconciler.count() == 1).await;
    assert!(running.queue.is_waiting(&ObjectKey::namespaced("ns", "foo")));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(reconciler.count(), 1);
    eventually("periodic check", || reconciler.count() == 2).await;
    let calls = reconciler.calls_for("ns/foo");
    assert!(calls[1] - calls[0] >= Duration::from_secs(30));

    running.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deletes_are_delivered_with_their_action() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let reconciler = Arc::new(Scripted::default());
    let running = start(source.clone(), reconciler.clone(), config(1));

    source.apply(configmap("ns", "foo"));
    eventually("add", || reconciler.count() == 1).await;
    source.delete("ns", "foo");
    eventually("delete", || reconciler.count() == 2).await;

    let calls = reconciler.calls.lock().unwrap().clone();
    assert_eq!(calls[1].1.action, Action::Delete);
    drop(calls);
    assert!(running.source.get_by_key(&ObjectKey::namespaced("ns", "foo")).unwrap().is_none());

    running.stop().await.unwrap();
}

/*
 * Level-triggered reconciler: it only looks at the cache, so running it
 * again without any change observes the same thing.
 */
struct Observer {
    source: Arc<FakeSource>,
    observed: Mutex<Vec<Option<String>>>,
}

impl Reconciler for Observer {
    async fn reconcile(&self, item: &WorkItem) -> Result<Outcome, Error> {
	let current = self.source.get_by_key(&item.key)?;
	let seen = current.and_then(|cm| cm.metadata.resource_version.clone());
	self.observed.lock().unwrap().push(seen);

	Ok(Outcome::Synced)
    }
}

#[tokio::test(start_paused = true)]
async fn reconcile_again_without_change_observes_the_same_state() {
    let source = Arc::new(FakeSource::default());
    source.mark_synced();
    let mut obj = configmap("ns", "foo");
    obj.metadata.resource_version = Some("7".to_string());
    source.apply(obj);

    let observer = Arc::new(Observer{
	source: source.clone(),
	observed: Mutex::new(vec![]),
    });
    let controller: Controller<ConfigMap, _, _> = Controller::new("observer", source.clone(), observer.clone(), config(1));
    let item = WorkItem::new(Action::Update, ObjectKey::namespaced("ns", "foo"));

    controller.queue().add(item.clone());
    controller.queue().add(item);
    let cancel = CancellationToken::new();
    let handle = {
	let cancel = cancel.clone();
	tokio::spawn(async move { controller.run(cancel).await })
    };

    eventually("first pass", || observer.observed.lock().unwrap().len() == 1).await;
    // a resync delivers the unchanged object again
    source.apply({
	let mut obj = configmap("ns", "foo");
	obj.metadata.resource_version = Some("7".to_string());
	obj
    });
    eventually("second pass", || observer.observed.lock().unwrap().len() == 2).await;

    let observed = observer.observed.lock().unwrap().clone();
    assert_eq!(observed, vec![Some("7".to_string()), Some("7".to_string())]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
