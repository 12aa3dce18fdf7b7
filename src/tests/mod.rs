//! Test modules for the runtime crate

mod channel_tests;
mod config_tests;
mod io_tests;
mod select_tests;
mod task_tests;
mod test_utils;
mod timer_tests;
