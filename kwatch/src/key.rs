use crate::errors::Error;

use kube::Resource;
use std::fmt;

/*
 * ObjectKey identifies a watched object for the whole of its lifetime:
 * its namespace (when namespaced) and its name. Two notifications about
 * the same object always produce equal keys, whatever their payload.
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {

    pub fn new(namespace: Option<&str>, name: &str) -> Self {
	Self{
	    namespace: namespace.map(str::to_string),
	    name: name.to_string(),
	}
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
	Self::new(Some(namespace), name)
    }

    /*
     * Split a "namespace/name" (or bare "name") key back into its parts.
     */
    pub fn parse(key: &str) -> Result<Self, Error> {
	let parts: Vec<&str> = key.split('/').collect();

	match parts.as_slice() {
	    [name] if !name.is_empty() => Ok(Self::new(None, name)),
	    [namespace, name] if !name.is_empty() => {
		let namespace = non_empty(namespace);
		Ok(Self::new(namespace, name))
	    },
	    _ => Err(Error::InvalidKey(key.to_string())),
	}
    }
}

fn non_empty(namespace: &str) -> Option<&str> {
    if namespace.is_empty() {
	None
    } else {
	Some(namespace)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match &self.namespace {
	    Some(ns) => write!(f, "{}/{}", ns, self.name),
	    None => write!(f, "{}", self.name),
	}
    }
}

/*
 * Build the queue key for an object out of its metadata. Objects without
 * a name can't be tracked, the caller is expected to log and drop them.
 */
pub fn meta_namespace_key<K: Resource>(obj: &K) -> Result<ObjectKey, Error> {
    let meta = obj.meta();

    let name = match meta.name.as_deref() {
	Some(name) if !name.is_empty() => name,
	_ => return Err(Error::MissingName),
    };
    let namespace = meta.namespace.as_deref().and_then(non_empty);

    Ok(ObjectKey::new(namespace, name))
}
