//! Phantom-tagged identifiers.
//!
//! Every id space in this crate (models, job types, instances, jobs) is
//! backed by a plain string or UUID, but the *spaces* must never be mixed up
//! at a call site. `Id<T>` carries no runtime cost over `String` and makes
//! that mixup a compile error.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Id { value: value.into(), _marker: PhantomData }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<T> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full_name = std::any::type_name::<T>();
        let clean_name = full_name.rsplit("::").next().unwrap_or(full_name);
        write!(f, "{}({:?})", clean_name, self.value)
    }
}

impl<T> From<Id<T>> for String {
    fn from(id: Id<T>) -> Self {
        id.value
    }
}

impl<T> From<&str> for Id<T> {
    fn from(value: &str) -> Self {
        Id::new(value)
    }
}

impl<T> From<String> for Id<T> {
    fn from(value: String) -> Self {
        Id::new(value)
    }
}

#[derive(Debug)]
pub struct ModelTag;
#[derive(Debug)]
pub struct JobTypeTag;
#[derive(Debug)]
pub struct InstanceTag;
#[derive(Debug)]
pub struct JobTag;

pub type ModelId = Id<ModelTag>;
pub type JobTypeId = Id<JobTypeTag>;
pub type InstanceId = Id<InstanceTag>;
pub type JobId = Id<JobTag>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_debug_differ() {
        let m: ModelId = Id::new("gpt-x");
        assert_eq!(m.to_string(), "gpt-x");
        assert!(format!("{:?}", m).starts_with("ModelTag"));
    }

    #[test]
    fn equality_is_by_value() {
        let a: ModelId = Id::new("a");
        let b: ModelId = Id::new("a");
        assert_eq!(a, b);
    }
}
