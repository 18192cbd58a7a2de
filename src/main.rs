#[tokio::main]
async fn main() {
    let code = wheelhouse::cli::run().await;
    if code != 0 {
        std::process::exit(code);
    }
}
