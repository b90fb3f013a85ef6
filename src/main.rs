// Main entry point - lance le serveur proxy local
use ntlm_proxy::config::Config;
use ntlm_proxy::context::ProxyContext;
use ntlm_proxy::server::ProxyServer;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Créer un fichier de logs
    let log_file_path = {
        let app_data = dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let proxy_dir = app_data.join("ntlm-proxy");
        let _ = std::fs::create_dir_all(&proxy_dir);
        proxy_dir.join("ntlm-proxy.log")
    };

    // Utiliser tracing_appender pour écrire dans un fichier
    let file_appender = tracing_appender::rolling::never(
        log_file_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        log_file_path.file_name().unwrap_or_default()
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .init();

    tracing::info!("Démarrage de ntlm-proxy");
    tracing::info!("Fichier de logs: {:?}", log_file_path);

    // Charger la configuration
    let config = Config::load().unwrap_or_default();

    let context = Arc::new(ProxyContext::new(config));
    let mut server = ProxyServer::new(context);
    server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Impossible de démarrer le serveur proxy: {e}"))?;

    tokio::signal::ctrl_c().await?;

    tracing::info!("Arrêt du serveur proxy");
    server.close().await;
    Ok(())
}
