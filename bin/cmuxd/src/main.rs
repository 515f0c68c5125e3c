#![deny(unsafe_code)]

use std::{env, io, process::ExitCode};

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    let status = cmux_daemon::run(env::args_os(), &mut stdout, &mut stderr);
    ExitCode::from(u8::try_from(status).unwrap_or(1))
}
