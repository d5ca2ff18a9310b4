pub mod peers;
pub mod stubs;
