#![forbid(unsafe_code)]

fn main() {
    // Values in a local .env fill in unset environment variables.
    let _ = dotenvy::dotenv();
    std::process::exit(walkeeper_cli::run());
}
