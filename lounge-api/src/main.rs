fn main() {
    if let Err(err) = lounge_billing::app::run_api() {
        eprintln!("api startup failed: {err}");
        std::process::exit(1);
    }
}
