pub mod inference;
pub mod result;
pub mod stats;
pub mod work_item;
