use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    aio_relay::logging::init();

    match aio_relay::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
