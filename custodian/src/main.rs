use std::error::Error;

use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        return Err("Installing default CryptoProvider".into());
    }

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = custodian_core::Settings::load()
        .map_err(|e| format!("Error loading settings: {e}"))?;

    custodian_core::run(settings)
        .await
        .map_err(|e| format!("Error running custodian: {e:?}"))?;

    Ok(())
}
