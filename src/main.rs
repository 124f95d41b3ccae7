use clap::Parser;

use ptbox::ptbox::options::Options;

fn main() -> anyhow::Result<()> {
    let opt = Options::parse();
    let level = match opt.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    let ec = ptbox::run_ptbox(opt)?;
    std::process::exit(ec);
}
