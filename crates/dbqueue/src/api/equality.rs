//! Value equality for trait objects
//!
//! Producers and consumers hand out `Arc<dyn ...>` transformers and routers,
//! and the registry must compare them by value. Any `'static + PartialEq`
//! type gets [`DynEq`] for free; traits that need comparison list it as a
//! supertrait and implement `PartialEq` for their `dyn` type via [`DynEq::dyn_eq`].

use std::any::Any;

pub trait DynEq: Any {
    fn as_any(&self) -> &dyn Any;

    /// True when `other` has the same concrete type and an equal value
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Any + PartialEq> DynEq for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }
}
