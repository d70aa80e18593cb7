use kwatch::Error;
use kwatch::Outcome;
use kwatch::Reconciler;
use kwatch::WorkItem;
use kwatch_api as api;

use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use log;
use serde_json::json;
use serde_json::Value;

/*
 * SampleReconciler fetches the current Sample from the control plane and
 * records the generation it has seen in the status subresource.
 */
pub struct SampleReconciler {
    kube_client: KubeClient,
}

/*
 * Status patch bringing .status.observedGeneration up to date, or None
 * when there is nothing to write.
 */
pub fn status_patch(sample: &api::Sample) -> Option<Value> {
    let generation = sample.metadata.generation?;
    let observed = sample.status.as_ref().and_then(|status| status.observed_generation);

    if observed == Some(generation) {
	return None;
    }

    Some(json!({
	"status": {
	    "observedGeneration": generation,
	}
    }))
}

impl SampleReconciler {

    pub fn new(kube_client: KubeClient) -> Self {
	Self{
	    kube_client: kube_client,
	}
    }

    fn samples(&self, namespace: Option<&str>) -> KubeApi<api::Sample> {
	match namespace {
	    Some(ns) => KubeApi::namespaced(self.kube_client.clone(), ns),
	    None => KubeApi::default_namespaced(self.kube_client.clone()),
	}
    }
}

impl Reconciler for SampleReconciler {

    async fn reconcile(&self, item: &WorkItem) -> Result<Outcome, Error> {
	let samples = self.samples(item.key.namespace.as_deref());
	let name = item.key.name.as_str();

	let sample = match samples.get_opt(name).await {
	    Ok(Some(sample)) => sample,
	    Ok(None) => {
		log::info!("sample {} not found, nothing to do", item.key);
		return Ok(Outcome::NotFound);
	    },
	    Err(err) => {
		log::error!("unable to get sample {}: {}", item.key, err);
		return Err(Error::Kube(err));
	    }
	};

	log::info!("{} sample {}, foo: {:?}, obj: {:?}", item.action, item.key, sample.foo(), sample.spec);

	if let Some(patch) = status_patch(&sample) {
	    log::debug!("Updating status of sample {}: {}", item.key, patch);

	    let params = KubePatchParams::default();
	    samples.patch_status(name, &params, &KubePatch::Merge(&patch)).await?;
	}

	Ok(Outcome::Synced)
    }
}
