mod test_monitor;
pub mod utils;
