pub(crate) mod allocator;
pub(crate) mod arena;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod free_list;
pub(crate) mod refill;
pub(crate) mod registry;
pub(crate) mod size_class;
pub(crate) mod slab;
pub(crate) mod stats;
pub(crate) mod thread_cache;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
