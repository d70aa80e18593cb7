use kwatch::Error;
use kwatch::NotificationSource;
use kwatch::Outcome;
use kwatch::Reconciler;
use kwatch::WorkItem;

use k8s_openapi::api::apps::v1::Deployment;
use log;
use std::sync::Arc;

/*
 * DeploymentReconciler reports the current state of every Deployment it
 * is handed. It reads from the source cache only, so running it again
 * for the same key is harmless.
 */
pub struct DeploymentReconciler<S: NotificationSource<Deployment>> {
    lister: Arc<S>,
}

/*
 * One line summary of a deployment's replicas, for example:
 *
 *   replicas: 3 desired, 2 updated, 2 ready, 2 available
 */
pub fn replica_summary(deployment: &Deployment) -> String {
    let desired = deployment.spec.as_ref()
	.and_then(|spec| spec.replicas)
	.unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();

    format!("replicas: {} desired, {} updated, {} ready, {} available",
	    desired,
	    status.updated_replicas.unwrap_or(0),
	    status.ready_replicas.unwrap_or(0),
	    status.available_replicas.unwrap_or(0))
}

impl<S: NotificationSource<Deployment>> DeploymentReconciler<S> {

    pub fn new(lister: Arc<S>) -> Self {
	Self{
	    lister: lister,
	}
    }
}

impl<S: NotificationSource<Deployment>> Reconciler for DeploymentReconciler<S> {

    async fn reconcile(&self, item: &WorkItem) -> Result<Outcome, Error> {
	let namespace = item.key.namespace.as_deref().unwrap_or_default();
	let name = item.key.name.as_str();

	let deployment = match self.lister.get_by_key(&item.key)? {
	    Some(deployment) => deployment,
	    None => {
		log::info!("deployment is gone ({}), namespace: {}, name: {}", item.action, namespace, name);
		return Ok(Outcome::NotFound);
	    }
	};

	log::info!("{} deployment, namespace: {}, name: {}, generation: {}, {}",
		   item.action, namespace, name,
		   deployment.metadata.generation.unwrap_or(0),
		   replica_summary(&deployment));

	Ok(Outcome::Synced)
    }
}
