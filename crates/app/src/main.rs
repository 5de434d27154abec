mod cli;

use clap::Parser;

fn main() {
    let cli = cli::Cli::parse();
    let _telemetry = inspection::telemetry::enter_runtime(cli.verbose());
    if let Err(err) = cli::handle_command(cli) {
        tracing::error!("{err:?}");
        std::process::exit(1);
    }
}
