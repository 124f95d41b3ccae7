use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug,Parser)]
#[command(version, about)]
#[command(after_long_help="Logging is controlled with various -v options or via the RUST_LOG/RUST_LOG_STYLE\nas described in https://docs.rs/env_logger documentation.")]
pub struct Options {
    /// Generate verbose output.  Twice for additional verbosity.
    #[arg(short, long, action=clap::ArgAction::Count, global=true)]
    pub verbose : u8,
    #[command(subcommand)]
    pub subcommand : PtboxCommand
}

#[derive(Debug,Subcommand)]
pub enum PtboxCommand {
    /// Run a command, killing it on the first syscall its policy forbids
    #[command(display_order=0)]
    Run(RunOptions),
    /// Print the syscall names known for this host
    #[command(display_order=1)]
    Syscalls(SyscallsOptions)
}

#[derive(Debug,Parser)]
pub struct RunOptions {
    /// Start from a predefined policy
    #[arg(long, value_enum)]
    pub preset : Option<Preset>,
    /// Allow the named (or numbered) syscall
    #[arg(short, long)]
    pub allow : Vec<String>,
    /// Allow the syscall only when its first argument is stdout or stderr
    #[arg(long="stdout-stderr")]
    pub stdio : Vec<String>,
    /// Allow the syscall, logging its arguments and result
    #[arg(long)]
    pub audit : Vec<String>,
    /// Forbid the syscall (applied after everything else)
    #[arg(short, long)]
    pub deny : Vec<String>,
    /// Only stop the command for signals and exit; never examine syscalls
    #[arg(long="no-trace-syscalls")]
    pub no_trace_syscalls : bool,
    /// Write the lifecycle events of the run to this file, one JSON object per line
    #[arg(short, long)]
    pub events : Option<PathBuf>,
    /// The command to run
    #[arg(last = true)]
    pub command : Vec<String>
}

#[derive(Debug,Parser)]
pub struct SyscallsOptions {
    /// Only resolve these names (or numbers)
    pub names : Vec<String>
}

#[derive(Clone,Copy,Debug,Eq,PartialEq)]
#[derive(ValueEnum)]
pub enum Preset {
    /// What a C program needs to start, read its input, write to
    /// stdout/stderr and exit, plus harmless queries such as stat.  Files may
    /// only be opened read-only, and the program may not exec again.
    Basic,
    /// Every syscall is allowed; combine with --deny
    Permissive
}
