use std::sync::Arc;

use catalog_core::PgRepository;
use catalog_janitor::{app_context::AppContext, config::Config, http, janitor::Janitor};
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;
    let janitor_config = config.get_janitor_config();

    info!("Starting janitor with ID {:?}", janitor_config.settings.id);

    let repo = PgRepository::new(janitor_config.pool).await?;
    if config.run_migrations {
        repo.run_migrations().await?;
    }

    let janitor = Janitor::new(Arc::new(repo), janitor_config.settings);
    let context = Arc::new(AppContext::new(janitor, true));

    let app = http::app(context.clone())?;
    let bind = format!("{}:{}", config.host, config.port);

    let janitor_loop = tokio::spawn(async move { context.cleanup_loop().await });
    let http_server = tokio::spawn(http::listen(app, bind));

    tokio::select! {
        res = janitor_loop => {
            error!("janitor loop exited");
            if let Err(e) = res {
                error!("janitor failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("exiting");
    Ok(())
}
