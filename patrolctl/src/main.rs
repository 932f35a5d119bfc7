use clap::Parser;

fn main() {
    let cli = patrolctl::Cli::parse();
    if let Err(err) = patrolctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
