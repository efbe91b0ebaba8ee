pub mod api_types;
pub mod cache;
pub mod office;
pub mod refresh;
pub mod store;
pub mod upstream;
