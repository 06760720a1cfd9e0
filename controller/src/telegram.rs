use std::{sync::Arc, thread, time::Duration};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
};
use esp_idf_svc::http::client::{Configuration as HttpClientConfiguration, EspHttpConnection};
use log::{info, warn};

use crockpot_common::{
    handle_command,
    telegram::{
        clamp_message, send_message_url, updates_url, SendMessage, UpdatesResponse,
        POLL_TIMEOUT_SECS, RETRY_INTERVAL_SECS,
    },
    Connectivity, Crockpot, RelayActuator,
};

const MAX_RESPONSE_BYTES: usize = 16 * 1024;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run_bot<R, N>(token: String, crockpot: Arc<Crockpot<R>>, network: N) -> !
where
    R: RelayActuator,
    N: Connectivity,
{
    info!("telegram bot started");
    let mut offset = 0_i64;

    loop {
        if !network.is_connected() {
            thread::sleep(Duration::from_secs(RETRY_INTERVAL_SECS));
            continue;
        }

        let response = match fetch_updates(&token, offset) {
            Ok(response) => response,
            Err(err) => {
                warn!("telegram poll failed: {err:#}");
                thread::sleep(Duration::from_secs(RETRY_INTERVAL_SECS));
                continue;
            }
        };

        if !response.ok {
            warn!("telegram API returned an error");
            thread::sleep(Duration::from_secs(RETRY_INTERVAL_SECS));
            continue;
        }

        let (commands, next_offset) = response.commands(offset);
        offset = next_offset;

        for command in commands {
            let reply = handle_command(&crockpot, &command.text);
            if let Err(err) = send_message(&token, command.chat_id, &reply) {
                warn!("telegram reply to chat {} failed: {err:#}", command.chat_id);
            }
        }

        thread::sleep(Duration::from_millis(100));
    }
}

fn client(timeout: Duration) -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(timeout),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&http_conf)?))
}

fn fetch_updates(token: &str, offset: i64) -> anyhow::Result<UpdatesResponse> {
    let mut client = client(Duration::from_secs(POLL_TIMEOUT_SECS + 5))?;
    let request = client.request(Method::Get, &updates_url(token, offset), &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if status != 200 {
        return Err(anyhow!("getUpdates returned HTTP {status}"));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_RESPONSE_BYTES {
            return Err(anyhow!("getUpdates response too large"));
        }
        body.extend_from_slice(&chunk[..read]);
    }

    serde_json::from_slice(&body).context("malformed getUpdates response")
}

fn send_message(token: &str, chat_id: i64, text: &str) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(&SendMessage {
        chat_id,
        text: clamp_message(text),
    })?;
    let content_length = payload.len().to_string();
    let headers = [
        ("Content-Type", "application/json"),
        ("Content-Length", content_length.as_str()),
    ];

    let mut client = client(SEND_TIMEOUT)?;
    let mut request = client.request(Method::Post, &send_message_url(token), &headers)?;
    request.write_all(&payload).map_err(|e| anyhow!("{e:?}"))?;
    request.flush().map_err(|e| anyhow!("{e:?}"))?;
    let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if status != 200 {
        return Err(anyhow!("sendMessage returned HTTP {status}"));
    }
    Ok(())
}
