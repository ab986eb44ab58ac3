pub mod api;
pub mod count;
pub mod status;
