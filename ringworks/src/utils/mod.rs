pub(crate) mod scope_guard;
pub(crate) mod thread;
