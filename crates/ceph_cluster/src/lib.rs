pub mod api;
pub mod ceph;
pub mod cluster_info;
pub mod controllers;
pub mod placement;
pub mod reporting;
pub mod util;
