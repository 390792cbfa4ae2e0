pub mod findcontent;
pub mod findnodes;
pub mod query;
