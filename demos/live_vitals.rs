use std::error::Error;

use secrecy::SecretString;
use tokio::sync::mpsc;
use vitals_stream::{SessionIdentity, SessionManager, StreamConfig, VitalsEvent};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitals_stream=debug".into()),
        )
        .init();

    let subject_id = "REPLACE_WITH_USER_ID".to_string();
    let token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut manager = SessionManager::new(StreamConfig::from_env());
        let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel::<VitalsEvent>();

        manager.start(
            SessionIdentity::new(subject_id, SecretString::new(token)),
            move |event| {
                let _ = refresh_tx.send(event);
            },
        );

        let mut status = manager.subscribe();
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(event) = refresh_rx.recv() => {
                    println!("event={} payload={:?}", event.event, event.payload);
                }
                Ok(()) = status.changed() => {
                    let snapshot = status.borrow_and_update().clone();
                    println!(
                        "state={:?} attempt={} next_retry_in={:?}",
                        snapshot.state, snapshot.attempt, snapshot.next_retry_in
                    );
                }
                _ = &mut shutdown => break,
            }
        }

        manager.stop_and_wait().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
