//! Binary entrypoint for `xmpd-server`.

mod app;
mod ingress;
mod network;
mod session;

fn main() {
    if let Err(err) = app::run() {
        eprintln!("failed to start xmpd-server: {err}");
        std::process::exit(1);
    }
}
