use clap::error::ErrorKind;
use clap::Parser;

use fleetmon::cli::{self, Cli, EXIT_FAILURE, EXIT_OK, EXIT_USAGE};
use fleetmon::ui::{MessageBlock, OutputMode, PlainRenderer, Renderer};

fn main() {
    let output_mode = OutputMode::from_env();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            std::process::exit(EXIT_OK);
        }
        Err(err) => {
            let mut renderer = PlainRenderer::stderr(output_mode);
            let _ = renderer.error_block(
                &MessageBlock::new("Invalid command arguments", err.to_string())
                    .with_hint("Run `fleetmon --help` to see supported command forms"),
            );
            std::process::exit(EXIT_USAGE);
        }
    };

    match cli::run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let mut renderer = PlainRenderer::stderr(output_mode);
            let _ = renderer.error_block(&MessageBlock::new("Session failed", err.to_string()));
            std::process::exit(EXIT_FAILURE);
        }
    }
}
