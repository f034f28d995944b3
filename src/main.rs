fn main() {
    if let Err(err) = lounge_billing::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
