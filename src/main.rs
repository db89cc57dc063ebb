use std::process;

fn main() {
    if let Err(err) = applier::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
