//! CLIP v2 transport: REST calls plus the eventstream reader task.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HueBridgeConfig;
use crate::hue::model::{parse_items, FullState, HueEventType, HueItem};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HueError {
    /// The bridge rejected the application key. Fatal: a key has to be
    /// created via the bridge link button before the service can run.
    #[error("hue bridge rejected the application key, create one via the link button first")]
    Unauthorized,

    #[error("hue bridge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hue bridge returned an unexpected response: {0}")]
    Api(String),

    #[error("hue client is not connected")]
    NotConnected,
}

/// One item handed over from the eventstream task.
#[derive(Debug, Clone, PartialEq)]
pub enum HueStreamEvent {
    Resource(HueEventType, HueItem),
    /// The push stream dropped; cached state may be stale.
    Disconnected,
}

#[async_trait]
pub trait HueClient {
    async fn connect(&mut self) -> Result<(), HueError>;

    async fn fetch_full_state(&mut self) -> Result<FullState, HueError>;

    /// Apply on/off and/or brightness to a single light resource.
    async fn set_light(
        &mut self,
        id: &str,
        on: Option<bool>,
        brightness: Option<f64>,
    ) -> Result<(), HueError>;

    /// Non-blocking intake of buffered push events.
    fn drain_events(&mut self) -> Vec<HueStreamEvent>;

    async fn close(&mut self);
}

/// Production client talking to a real bridge.
///
/// REST requests go through reqwest with the bridge's self-signed
/// certificate accepted. Push events are read by a background task that
/// feeds an unbounded channel; the scheduler drains it once per tick.
pub struct ClipClient {
    base_url: String,
    http: reqwest::Client,
    event_rx: mpsc::UnboundedReceiver<HueStreamEvent>,
    event_tx: mpsc::UnboundedSender<HueStreamEvent>,
    stream_task: Option<JoinHandle<()>>,
}

impl ClipClient {
    pub fn new(config: &HueBridgeConfig) -> Result<Self, HueError> {
        let mut headers = HeaderMap::new();
        let app_key = HeaderValue::from_str(&config.app_key)
            .map_err(|_| HueError::Api("application key is not a valid header value".into()))?;
        headers.insert("hue-application-key", app_key);

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .default_headers(headers)
            .build()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            base_url: format!("https://{}", config.host),
            http,
            event_rx,
            event_tx,
            stream_task: None,
        })
    }

    async fn fetch_resources(&self, rtype: &str) -> Result<Vec<HueItem>, HueError> {
        let url = format!("{}/clip/v2/resource/{rtype}", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = check_status(response)?;

        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            data: Vec<serde_json::Value>,
        }
        let body: Body = response.json().await?;
        Ok(parse_items(body.data))
    }
}

#[async_trait]
impl HueClient for ClipClient {
    async fn connect(&mut self) -> Result<(), HueError> {
        // Probe a cheap resource first so a bad key fails loudly here
        // instead of inside the stream task.
        let url = format!("{}/clip/v2/resource/bridge", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response)?;

        if self.stream_task.is_none() {
            self.stream_task = Some(tokio::spawn(run_event_stream(
                self.http.clone(),
                format!("{}/eventstream/clip/v2", self.base_url),
                self.event_tx.clone(),
            )));
        }
        Ok(())
    }

    async fn fetch_full_state(&mut self) -> Result<FullState, HueError> {
        Ok(FullState {
            devices: self.fetch_resources("device").await?,
            lights: self.fetch_resources("light").await?,
            rooms: self.fetch_resources("room").await?,
            zones: self.fetch_resources("zone").await?,
            grouped_lights: self.fetch_resources("grouped_light").await?,
        })
    }

    async fn set_light(
        &mut self,
        id: &str,
        on: Option<bool>,
        brightness: Option<f64>,
    ) -> Result<(), HueError> {
        let mut body = serde_json::Map::new();
        if let Some(on) = on {
            body.insert("on".into(), serde_json::json!({ "on": on }));
        }
        if let Some(brightness) = brightness {
            body.insert("dimming".into(), serde_json::json!({ "brightness": brightness }));
        }

        let url = format!("{}/clip/v2/resource/light/{id}", self.base_url);
        let response = self
            .http
            .put(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&serde_json::Value::Object(body))
            .send()
            .await?;
        check_status(response)?;
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<HueStreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn close(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HueError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HueError::Unauthorized),
        status if !status.is_success() => {
            Err(HueError::Api(format!("unexpected status {status}")))
        }
        _ => Ok(response),
    }
}

/// Read the SSE eventstream forever, reconnecting after failures.
async fn run_event_stream(
    http: reqwest::Client,
    url: String,
    tx: mpsc::UnboundedSender<HueStreamEvent>,
) {
    loop {
        match open_and_read_stream(&http, &url, &tx).await {
            Ok(()) => debug!("hue event stream ended"),
            Err(err) => warn!("hue event stream failed: {err}"),
        }
        if tx.send(HueStreamEvent::Disconnected).is_err() {
            return;
        }
        tokio::time::sleep(STREAM_RETRY_DELAY).await;
    }
}

async fn open_and_read_stream(
    http: &reqwest::Client,
    url: &str,
    tx: &mpsc::UnboundedSender<HueStreamEvent>,
) -> Result<(), HueError> {
    let mut response = http
        .get(url)
        .header("Accept", "text/event-stream")
        .send()
        .await?;
    check_status_ref(&response)?;
    debug!("hue event stream connected");

    let mut buffer = String::new();
    while let Some(chunk) = response.chunk().await? {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);
            if let Some(payload) = line.strip_prefix("data:") {
                for event in parse_stream_frames(payload.trim()) {
                    if tx.send(event).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_status_ref(response: &reqwest::Response) -> Result<(), HueError> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HueError::Unauthorized),
        status if !status.is_success() => {
            Err(HueError::Api(format!("unexpected status {status}")))
        }
        _ => Ok(()),
    }
}

/// One `data:` line holds an array of frames, each carrying a batch of
/// resources. Unknown frame or resource types are skipped.
fn parse_stream_frames(payload: &str) -> Vec<HueStreamEvent> {
    #[derive(Deserialize)]
    struct Frame {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        data: Vec<serde_json::Value>,
    }

    let frames: Vec<Frame> = match serde_json::from_str(payload) {
        Ok(frames) => frames,
        Err(err) => {
            debug!("skipping unparseable event frame: {err}");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for frame in frames {
        let Some(event_type) = HueEventType::from_wire(&frame.kind) else {
            continue;
        };
        for item in parse_items(frame.data) {
            events.push(HueStreamEvent::Resource(event_type, item));
        }
    }
    events
}

#[cfg(test)]
pub struct MockHueClient {
    pub state: FullState,
    pub events: Vec<HueStreamEvent>,
    pub set_light_calls: Vec<(String, Option<bool>, Option<f64>)>,
    pub fail_set_light: Vec<String>,
    pub connected: bool,
}

#[cfg(test)]
impl MockHueClient {
    pub fn new(state: FullState) -> Self {
        Self {
            state,
            events: Vec::new(),
            set_light_calls: Vec::new(),
            fail_set_light: Vec::new(),
            connected: false,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl HueClient for MockHueClient {
    async fn connect(&mut self) -> Result<(), HueError> {
        self.connected = true;
        Ok(())
    }

    async fn fetch_full_state(&mut self) -> Result<FullState, HueError> {
        if !self.connected {
            return Err(HueError::NotConnected);
        }
        Ok(self.state.clone())
    }

    async fn set_light(
        &mut self,
        id: &str,
        on: Option<bool>,
        brightness: Option<f64>,
    ) -> Result<(), HueError> {
        if self.fail_set_light.iter().any(|failing| failing == id) {
            return Err(HueError::Api("mock failure".into()));
        }
        self.set_light_calls.push((id.to_string(), on, brightness));
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<HueStreamEvent> {
        std::mem::take(&mut self.events)
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}
