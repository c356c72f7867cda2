mod config;
mod logging;

use std::time::Duration;

use bridge_core::{
    BridgeError, BridgeEvent, ChannelKind, EventFilter, EventStream, InitialSync,
    SendMessageOptions,
};
use bridge_runtime::{BlockingEngine, Bridge, LoopbackEngine, Session};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SmokeConfig};

/// How long to wait for the echo of a sent message.
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum SmokeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("no echo of {0} within {ECHO_TIMEOUT:?}")]
    NoEcho(&'static str),
}

#[tokio::main]
async fn main() {
    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    logging::init(config.log_level);

    if let Err(err) = run(config).await {
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), SmokeError> {
    if config.credentials_from_env {
        info!("using credentials from the environment against the loopback engine");
    }
    let enable_e2ee = config.session.enable_e2ee;

    let bridge = Bridge::new(BlockingEngine::new(LoopbackEngine::new()));
    let session = bridge.create(config.session).await?;
    let handle = session.handle();
    let (_, mut events) = session.subscribe_stream(EventFilter::All)?;

    let result = exercise(
        &session,
        &mut events,
        config.thread_id,
        &config.message,
        enable_e2ee,
    )
    .await;

    if let Err(err) = bridge.destroy(handle) {
        warn!(%handle, error = %err, "session destroy failed");
    }
    result
}

async fn exercise(
    session: &Session,
    events: &mut EventStream,
    thread_id: i64,
    text: &str,
    enable_e2ee: bool,
) -> Result<(), SmokeError> {
    if let InitialSync::Plain(sync) = session.connect().await? {
        info!(
            user_id = sync.user.id,
            threads = sync.initial_data.threads.len(),
            "plain channel connected"
        );
    }

    let sent = session
        .send_message(thread_id, SendMessageOptions::text(text))
        .await?;
    info!(message_id = %sent.message_id, thread_id, "message sent");
    wait_for_echo(events, "message", |event| {
        matches!(event, BridgeEvent::Message(message) if message.id == sent.message_id)
    })
    .await?;
    println!("plain echo received: {}", sent.message_id);

    if enable_e2ee {
        session.connect_e2ee().await?;
        let chat_jid = format!("{thread_id}@msgr");
        let sent = session.send_e2ee_message(&chat_jid, text, None).await?;
        info!(message_id = %sent.message_id, %chat_jid, "e2ee message sent");
        wait_for_echo(events, "e2ee message", |event| {
            matches!(event, BridgeEvent::E2eeMessage(message) if message.id == sent.message_id)
        })
        .await?;
        println!("e2ee echo received: {}", sent.message_id);
        session.disconnect(ChannelKind::E2ee).await?;
    }

    session.disconnect(ChannelKind::Plain).await?;
    Ok(())
}

async fn wait_for_echo<F>(
    events: &mut EventStream,
    what: &'static str,
    mut is_echo: F,
) -> Result<(), SmokeError>
where
    F: FnMut(&BridgeEvent) -> bool,
{
    let wait = async {
        while let Some(envelope) = events.recv().await {
            debug!(channel = envelope.channel.as_str(), kind = envelope.kind().as_tag(), "event");
            if is_echo(&envelope.event) {
                return true;
            }
        }
        false
    };
    match tokio::time::timeout(ECHO_TIMEOUT, wait).await {
        Ok(true) => Ok(()),
        _ => Err(SmokeError::NoEcho(what)),
    }
}
