use std::error::Error;

use serde_json::json;
use switchboard_sdk::session::proto::Kwargs;
use switchboard_sdk::{LifecycleEvent, SessionClient, SessionOptions};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = SessionClient::new(endpoint).with_options(
            SessionOptions::default().with_request_timeout(std::time::Duration::from_secs(5)),
        );
        let mut connection = client.connect().await?;
        println!("connected session_id={}", connection.session_id());

        let handle = connection.handle();
        handle
            .subscribe("chat.lobby", |event| {
                println!("event topic={} args={:?}", event.topic, event.args);
                Ok(())
            })
            .await?;
        handle
            .register("demo.echo", |args, _| Ok(Some(json!({ "echo": args }))))
            .await?;
        handle
            .publish("chat.lobby", vec![json!("hello from the demo")], Kwargs::new())
            .await?;

        match handle
            .call("demo.echo", vec![json!(1), json!(2)], Kwargs::new())
            .await
        {
            Ok(result) => println!("call result={result}"),
            Err(err) => println!("call failed: {err}"),
        }

        handle.close()?;
        while let Some(event) = connection.recv().await {
            if let LifecycleEvent::Closed | LifecycleEvent::Aborted { .. } = event {
                println!("session ended: {event:?}");
                break;
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
