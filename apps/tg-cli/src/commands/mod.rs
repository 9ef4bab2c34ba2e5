pub mod audit;
pub mod policy;
pub mod staged;
pub mod watermark;
