use std::process::ExitCode;

pub fn main() -> ExitCode {
    fuzzsteer::cli::main()
}
