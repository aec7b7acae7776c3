use std::env;

use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let cmd = args.next().unwrap_or_default();
    if cmd != "serve" {
        eprintln!("Usage: recap serve --config <path>");
        std::process::exit(2);
    }

    let mut config_path = String::from("./config/example-config.yaml");
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = v;
            }
        }
    }

    let cfg = match recap_config::load_and_validate(&config_path) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let secrets = match recap_config::secrets_from_env() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to resolve secrets: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "starting recap - listen_addr={}, ai_enabled={}",
        cfg.server.listen_addr,
        secrets.openai_api_key.is_some()
    );

    if let Err(e) = recap_server::serve(cfg, secrets).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}
