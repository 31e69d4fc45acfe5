mod build_ebpf;
mod run;

use std::process::exit;

use clap::Parser;

#[derive(Debug, Parser)]
pub struct Options {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Build the kernel programs
    BuildEbpf(build_ebpf::Options),
    /// Type check the kernel programs without producing an object
    Check(build_ebpf::Options),
    /// Build everything and run the agent
    Run(run::Options),
    /// Run the workspace tests
    Test(test::Options),
}

fn main() {
    let opts = Options::parse();

    use Command::*;
    let ret = match opts.command {
        BuildEbpf(opts) => build_ebpf::build_ebpf(&opts, false),
        Check(opts) => build_ebpf::build_ebpf(&opts, true),
        Run(opts) => run::run(opts),
        Test(opts) => test::test(opts),
    };

    if let Err(e) = ret {
        eprintln!("{e:#}");
        exit(1);
    }
}
