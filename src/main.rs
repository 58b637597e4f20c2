use chatbridge::error::AppError;
use chatbridge::settings::Settings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chatbridge=debug")),
        )
        .init();

    if std::env::args().nth(1).as_deref() == Some("login") {
        let settings = Settings::from_env();
        let http = reqwest::Client::new();
        if let Err(err) = chatbridge::oauth::login(&settings, &http).await {
            eprintln!("login failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = chatbridge::app::load_state()?;
    let app = chatbridge::app::build_app(state.clone());
    let addr: std::net::SocketAddr =
        state
            .runtime
            .listen
            .parse()
            .map_err(|err: std::net::AddrParseError| {
                AppError::new(axum::http::StatusCode::BAD_REQUEST, err.to_string())
            })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::new(axum::http::StatusCode::BAD_REQUEST, err.to_string()))?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::new(axum::http::StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(())
}
