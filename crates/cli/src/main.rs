//! The main entrypoint for snapos, which mostly just calls out into
//! `snapos_lib`.

use anyhow::Result;

fn run() -> Result<()> {
    snapos_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    snapos_utils::run_main(|| run().map_err(|e| (snapos_lib::error::exit_code_of(&e), e)));
}
