//! Keel core types: resource identities, managed objects, selectors,
//! call policies and the shared error taxonomy.

#![forbid(unsafe_code)]

mod error;
mod object;
mod policy;
mod selector;

pub use error::{Error, Result};
pub use object::{ManagedResource, ObjectMeta, ObjectRef, OwnerReference, ResourceKind};
pub use policy::{DeleteOptions, FetchErrors, PollSettings, Propagation, RetryPolicy, Verb, WriteOptions};
pub use selector::{LabelSelector, SelectorOperator, SelectorRequirement};

pub mod prelude {
    pub use super::{
        DeleteOptions, Error, FetchErrors, LabelSelector, ManagedResource, ObjectMeta, ObjectRef, OwnerReference,
        PollSettings, Propagation, ResourceKind, Result, RetryPolicy, Verb, WriteOptions,
    };
}
