pub mod api;
pub mod model;
pub mod service;
pub mod store;
pub mod views;

#[cfg(test)]
pub(crate) mod testing;
