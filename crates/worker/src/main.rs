use storefront_infra::StorefrontConfig;
use storefront_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = StorefrontConfig::from_env()?;

    let format = config.log_format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{e}; falling back to json logs");
        LogFormat::Json
    });
    storefront_observability::init_with(format);

    storefront_worker::run(config).await
}
