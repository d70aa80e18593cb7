use crate::errors::Error;
use crate::item::WorkItem;

use std::future::Future;
use std::time::Duration;

/*
 * What a successful reconcile asks the workers to do next. A failed
 * reconcile is reported through Err and retried with backoff.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {

    /* the object is in the desired state */
    Synced,

    /* the object is gone already, nothing left to do */
    NotFound,

    /* all good for now, look at it again later */
    RequeueAfter(Duration),
}

/*
 * Domain logic driven by the controller workers.
 *
 * Implementations must read the current state of the object behind
 * `item.key` instead of trusting whatever triggered the notification,
 * and must tolerate being called again for the same key at any time.
 */
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, item: &WorkItem) -> impl Future<Output = Result<Outcome, Error>> + Send;
}
