mod application;
mod presentation;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    if let Err(e) = application::run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
