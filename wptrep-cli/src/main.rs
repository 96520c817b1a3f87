// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use wptrep_cli::WptrepApp;

fn main() -> Result<()> {
    color_eyre::install()?;
    let app = WptrepApp::parse();
    let code = app.exec()?;
    std::process::exit(code)
}
