use growatt_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(e) = growatt_bridge::run(options).await {
        // logging may not be up yet if the config failed to load
        eprintln!("Error: {:?}", e);
        error!("{:?}", e);
        std::process::exit(255);
    }
}
