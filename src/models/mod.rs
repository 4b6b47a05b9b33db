pub mod classification;
pub mod job;
pub mod work_item;
