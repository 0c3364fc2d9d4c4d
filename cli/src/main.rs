//! The main entrypoint for devbox, a thin wrapper around the library.

use anyhow::Result;

fn run() -> Result<()> {
    devbox_utils::initialize_tracing();
    tracing::trace!("starting");
    devbox_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
