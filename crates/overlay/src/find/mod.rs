pub mod iterators;
pub mod query_info;
pub mod query_pool;
