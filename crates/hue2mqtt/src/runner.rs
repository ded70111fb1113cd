//! The cooperative scheduler driving the whole bridge.
//!
//! One loop, one tick. Every awaited work unit carries a hard deadline; a
//! hung vendor or broker call is treated as a broken connection and aborts
//! the run so external supervision can restart the process.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use anyhow::Context;
use rand::Rng;
use tokio::time::timeout;
use tracing::{error, info};

use crate::hue::client::HueClient;
use crate::hue::connector::HueConnector;
use crate::mqtt::client::MqttClient;
use crate::mqtt::proxy::MqttProxy;
use crate::thing::ThingRegistry;

const TICK: Duration = Duration::from_millis(50);
const WORK_TIMEOUT: Duration = Duration::from_secs(10);
const TIMER_PERIOD: Duration = Duration::from_secs(60);
const TIMER_JITTER_MS: i64 = 3000;

pub struct Runner<C, M> {
    things: ThingRegistry,
    connector: HueConnector<C>,
    proxy: MqttProxy<M>,
    next_mqtt_timer: Instant,
    next_hue_timer: Instant,
    shutdown: Arc<AtomicBool>,
}

impl<C: HueClient, M: MqttClient> Runner<C, M> {
    pub fn new(things: ThingRegistry, connector: HueConnector<C>, proxy: MqttProxy<M>) -> Self {
        Self {
            things,
            connector,
            proxy,
            next_mqtt_timer: Instant::now(),
            next_hue_timer: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Serve until a shutdown signal or a fatal error. Last-will
    /// publication and connection teardown run on every exit path.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        spawn_signal_listener(Arc::clone(&self.shutdown));

        let result = self.serve().await;
        if let Err(err) = &result {
            error!("runner stopped: {err:#}");
        }

        if let Err(err) = with_timeout(
            "last will publication",
            self.proxy.publish_last_wills(&mut self.things),
        )
        .await
        {
            error!("{err:#}");
        }
        self.proxy.disconnect().await;
        self.connector.close().await;
        result
    }

    async fn serve(&mut self) -> anyhow::Result<()> {
        self.connect().await?;
        info!("serving {} things", self.things.len());

        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick().await?;
            tokio::time::sleep(TICK).await;
        }
        info!("shutting down");
        Ok(())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        with_timeout("hue connect", self.connector.connect(&mut self.things))
            .await?
            .context("connecting to the hue bridge")?;
        with_timeout("mqtt connect", self.proxy.connect())
            .await?
            .context("connecting to the mqtt broker")?;
        self.next_mqtt_timer = jittered_deadline();
        self.next_hue_timer = jittered_deadline();
        Ok(())
    }

    /// One scheduler round: MQTT work, inbound routing, connector intake,
    /// Hue work. Pending state always beats the periodic timers.
    async fn tick(&mut self) -> anyhow::Result<()> {
        if self.proxy.fetch_state_changes(&mut self.things) {
            with_timeout("state publish", self.proxy.publish_state_messages())
                .await?
                .context("publishing state messages")?;
        } else if Instant::now() >= self.next_mqtt_timer {
            self.next_mqtt_timer = jittered_deadline();
            self.proxy.process_timer();
        }

        self.proxy.process_thing_commands(&mut self.things);

        self.connector.poll(&mut self.things);
        self.connector.flush_due(Instant::now(), &mut self.things);

        if self.connector.fetch_commands(&mut self.things) {
            with_timeout("command send", self.connector.send_commands(&self.things)).await?;
        } else if Instant::now() >= self.next_hue_timer {
            self.next_hue_timer = jittered_deadline();
            with_timeout("hue timer", self.connector.process_timer(&mut self.things))
                .await?
                .context("refreshing hue state")?;
        }

        Ok(())
    }

    #[cfg(test)]
    fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

/// Wrap one unit of work with the fatal deadline.
async fn with_timeout<T>(label: &str, work: impl Future<Output = T>) -> anyhow::Result<T> {
    timeout(WORK_TIMEOUT, work)
        .await
        .map_err(|_| anyhow!("{label} exceeded the {}s deadline", WORK_TIMEOUT.as_secs()))
}

/// Timer deadlines are jittered so periodic Hue and MQTT work does not
/// land on the same tick every period.
fn jittered_deadline() -> Instant {
    let jitter = rand::thread_rng().gen_range(-TIMER_JITTER_MS..=TIMER_JITTER_MS);
    let millis = TIMER_PERIOD.as_millis() as i64 + jitter;
    Instant::now() + Duration::from_millis(millis.max(0) as u64)
}

fn spawn_signal_listener(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown.store(true, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            error!("cannot listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
