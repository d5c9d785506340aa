pub mod checkpoint;
pub mod controller;
pub mod extractor;
pub mod limiter;
pub mod masters;
pub mod racing_api;
pub mod races;
pub mod results;
pub mod schedule;
