pub mod ptbox;

use crate::ptbox::options::{Options,PtboxCommand};
use crate::ptbox::run::{run_entrypoint,syscalls_entrypoint};

pub fn run_ptbox(opt : Options) -> anyhow::Result<i32> {
    match opt.subcommand {
        PtboxCommand::Run(run_opts) => { run_entrypoint(&run_opts) }
        PtboxCommand::Syscalls(syscalls_opts) => { syscalls_entrypoint(&syscalls_opts)?; Ok(0) }
    }
}
