use crate::key::ObjectKey;

use std::fmt;

/*
 * The kind of notification that produced a work item. It is only a hint:
 * workers re-read the object to learn what actually needs doing.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	let action = match self {
	    Action::Add => "add",
	    Action::Update => "update",
	    Action::Delete => "delete",
	};
	f.write_str(action)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub action: Action,
    pub key: ObjectKey,
}

impl WorkItem {

    pub fn new(action: Action, key: ObjectKey) -> Self {
	Self{
	    action: action,
	    key: key,
	}
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	write!(f, "{} {}", self.action, self.key)
    }
}
