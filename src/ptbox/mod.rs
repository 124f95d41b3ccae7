pub mod debugger;
pub mod error;
pub mod event;
pub mod handler;
pub mod kernel;
pub mod monitor;
pub mod options;
pub mod process;
pub mod run;
pub mod syscalls;
