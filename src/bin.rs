use parcel_tracker_lib::{config::Config, start};

#[doc(hidden)]
#[actix_web::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let config = Config::load()?;
    start(config).await?;
    Ok(())
}
