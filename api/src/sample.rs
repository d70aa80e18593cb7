use kube::api::ObjectMeta;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "yaocanwu.io", version = "v1alpha1", kind = "Sample", namespaced)]
#[kube(status = "SampleStatus")]
#[serde(rename_all = "camelCase")]
pub struct SampleSpec {

    /*
     * Free-form payload carried by the sample object. The controller
     * only reports it, it never acts on it.
     */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foo: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SampleStatus {

    // The last metadata.generation seen by a reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Sample {

    /*
     * Returns the spec payload, or an empty string when unset.
     */
    pub fn foo(&self) -> &str {
	self.spec.foo.as_deref().unwrap_or_default()
    }
}

pub fn new(namespace: &str, name: &str, foo: Option<&str>) -> Sample {
    let mut metadata = ObjectMeta::default();
    metadata.name = Some(name.to_string());
    metadata.namespace = Some(namespace.to_string());

    Sample{
	metadata: metadata,
	spec: SampleSpec{
	    foo: foo.map(str::to_string),
	},
	status: None,
    }
}
