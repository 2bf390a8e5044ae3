fn main() {
    if let Err(err) = hydrant::cli::run() {
        eprintln!("hydrant: {err:?}");
        std::process::exit(1);
    }
}
