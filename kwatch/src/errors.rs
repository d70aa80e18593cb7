use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /* a queue key that can't be split back into namespace/name */
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),

    #[error("object has no metadata.name, unable to build a key")]
    MissingName,

    #[error("failed to wait for caches to sync: {0}")]
    CacheSync(String),

    #[error("reconcile panicked: {0}")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("`{0}`")]
    Other(String),
}
