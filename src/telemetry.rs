//! Telemetry streams armed for one device handle.

use futures::StreamExt;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedSender;

use crate::bean::Bean;
use crate::plugin::{Event, Options};
use crate::poller::{self, Armed};
use crate::protocol::{ScratchBank, Telemetry};

/// Arm every stream `options` enables. Dropping the returned guards
/// disarms them.
pub fn arm(bean: &Bean, options: &Options, events: &UnboundedSender<Event>) -> Vec<Armed> {
    let mut armed = Vec::new();

    if options.broadcast_rssi {
        let bean = bean.clone();
        let events = events.clone();
        armed.push(poller::arm("rssi", options.rssi_interval(), move || {
            let bean = bean.clone();
            let events = events.clone();
            async move {
                let rssi = bean.rssi().await?;
                emit(&events, json!({ "rssi": rssi }));
                anyhow::Ok(())
            }
        }));
    }

    if options.broadcast_accel {
        armed.push(forward(bean, events, "accel", |reading| match reading {
            Telemetry::Accel { x, y, z } => Some(json!({ "accel": { "x": x, "y": y, "z": z } })),
            _ => None,
        }));
        let bean = bean.clone();
        armed.push(poller::arm("accel", options.accel_interval(), move || {
            let bean = bean.clone();
            async move { bean.request_accel().await.map_err(anyhow::Error::from) }
        }));
    }

    if options.broadcast_temp {
        armed.push(forward(bean, events, "temp", |reading| match reading {
            Telemetry::Temp(temp) => Some(json!({ "temp": temp })),
            _ => None,
        }));
        let bean = bean.clone();
        armed.push(poller::arm("temp", options.temp_interval(), move || {
            let bean = bean.clone();
            async move { bean.request_temp().await.map_err(anyhow::Error::from) }
        }));
    }

    for bank in options.scratch_banks() {
        armed.push(subscribe(bean, bank, events));
    }

    armed
}

fn emit(events: &UnboundedSender<Event>, data: Value) {
    debug!("data {}", data);
    let _ = events.send(Event::Data(data));
}

// Subscribes before returning so no reading requested afterwards is missed.
fn forward<F>(bean: &Bean, events: &UnboundedSender<Event>, name: &str, select: F) -> Armed
where
    F: Fn(Telemetry) -> Option<Value> + Send + 'static,
{
    let mut readings = bean.telemetry();
    let events = events.clone();
    Armed::spawn(format!("{} forwarder", name), async move {
        loop {
            match readings.recv().await {
                Ok(reading) => {
                    if let Some(data) = select(reading) {
                        emit(&events, data);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("skipped {} readings", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn subscribe(bean: &Bean, bank: ScratchBank, events: &UnboundedSender<Event>) -> Armed {
    let bean = bean.clone();
    let events = events.clone();
    Armed::spawn(bank.to_string(), async move {
        let mut values = match bean.scratch(bank).await {
            Ok(values) => values,
            Err(e) => {
                warn!("could not subscribe to {}: {}", bank, e);
                return;
            }
        };
        while let Some(value) = values.next().await {
            let mut data = Map::new();
            data.insert(bank.to_string(), value.into());
            emit(&events, Value::Object(data));
        }
    })
}
