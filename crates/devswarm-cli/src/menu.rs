//! Interactive stdin text menu for driving a fleet of virtual devices from
//! a single process: list, connect, disconnect, send a webhook, show
//! status.

use std::io::{self, Write};
use std::sync::Arc;

use devswarm_core::fleet::DeviceFleet;
use tokio::sync::Mutex;
use tracing::warn;

const MENU_TEXT: &str = "\
devswarm —  1) list devices
            2) connect <n>
            3) disconnect <n>
            4) send webhook <n> <path> <text>
            5) status
            6) quit
> ";

pub async fn run(fleet: Arc<Mutex<DeviceFleet>>) {
    loop {
        print!("{MENU_TEXT}");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if io::stdin().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            ["1"] | ["list"] => list_devices(&fleet).await,
            ["2", idx] | ["connect", idx] => connect_device(&fleet, idx).await,
            ["3", idx] | ["disconnect", idx] => disconnect_device(&fleet, idx).await,
            ["4", idx, path, text @ ..] | ["send", "webhook", idx, path, text @ ..] if !text.is_empty() => {
                send_webhook(&fleet, idx, path, &text.join(" ")).await
            }
            ["5"] | ["status"] => print_status(&fleet).await,
            ["6"] | ["quit"] | ["exit"] => break,
            _ => println!("unrecognized command: {line}"),
        }
    }
}

async fn index_session<'a>(fleet: &'a DeviceFleet, idx_str: &str) -> Option<(&'a str, &'a devswarm_core::DeviceSession)> {
    let idx: usize = idx_str.parse().ok()?;
    fleet.iter().nth(idx)
}

async fn list_devices(fleet: &Arc<Mutex<DeviceFleet>>) {
    let fleet = fleet.lock().await;
    for (i, (key, _)) in fleet.iter().enumerate() {
        println!("  [{i}] {key}");
    }
}

async fn connect_device(fleet: &Arc<Mutex<DeviceFleet>>, idx_str: &str) {
    let fleet = fleet.lock().await;
    match index_session(&fleet, idx_str).await {
        Some((key, session)) => {
            session.connect().await;
            println!("connecting {key}...");
        }
        None => warn!(idx = idx_str, "no such device index"),
    }
}

async fn disconnect_device(fleet: &Arc<Mutex<DeviceFleet>>, idx_str: &str) {
    let fleet = fleet.lock().await;
    match index_session(&fleet, idx_str).await {
        Some((key, session)) => {
            session.disconnect().await;
            println!("disconnected {key}");
        }
        None => warn!(idx = idx_str, "no such device index"),
    }
}

async fn send_webhook(fleet: &Arc<Mutex<DeviceFleet>>, idx_str: &str, path: &str, text: &str) {
    let fleet = fleet.lock().await;
    match index_session(&fleet, idx_str).await {
        Some((key, session)) => match session.send_webhook(path, text.as_bytes().to_vec()).await {
            Ok(()) => println!("sent webhook to {key} on {path}"),
            Err(e) => println!("failed to send webhook to {key}: {e}"),
        },
        None => warn!(idx = idx_str, "no such device index"),
    }
}

async fn print_status(fleet: &Arc<Mutex<DeviceFleet>>) {
    let fleet = fleet.lock().await;
    let connected = fleet.connected_count().await;
    println!("{connected}/{} devices connected", fleet.len());
    for (i, (key, session)) in fleet.iter().enumerate() {
        println!("  [{i}] {key} — {:?}", session.state().await);
    }
}
