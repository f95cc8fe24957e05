use authgate::{Gateway, StoreSet, providers::http_client_builder};
use miette::{IntoDiagnostic, Result, WrapErr, miette};
use std::path::PathBuf;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use url::Url;

mod proxy;
mod settings;

use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,authgate=debug")),
        )
        .init();

    let config_path = std::env::var("AUTHGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("authgate.json"));
    let settings = Settings::load(&config_path)?;

    let upstream_url = Url::parse(&settings.upstream)
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid upstream URL {:?}", settings.upstream))?;

    settings
        .gateway
        .validate()
        .map_err(|e| miette!("invalid configuration: {}", e))?;

    let stores = StoreSet::open(&settings.gateway.storage)
        .await
        .map_err(|e| miette!("opening storage: {}", e))?;
    let http = http_client_builder().build().into_diagnostic()?;

    let gateway = Gateway::builder()
        .config(settings.gateway.clone())
        .stores(stores)
        .http_client(http)
        .build()
        .map_err(|e| miette!("building gateway: {}", e))?;

    let proxy_client = http_client_builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .into_diagnostic()?;
    let app = gateway
        .router(proxy::router(upstream_url.clone(), proxy_client))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&settings.listen)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("binding {}", settings.listen))?;
    tracing::info!(
        listen = %settings.listen,
        upstream = %upstream_url,
        prefix = gateway.config().prefix(),
        providers = settings.gateway.providers.len(),
        "authgate listening"
    );
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}
