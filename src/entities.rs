//! Home-automation bus adapter (C3): typed state sinks published under a
//! discovery convention, with inbound command callbacks for the mutable ones.
//!
//! The wire transport (an MQTT broker connection) is out of this module's
//! scope per design; this module models the bus as a trait so the relay and
//! synthesizer can depend on a narrow contract instead of on `rumqttc`
//! directly. [`MqttEntityBus`] is the one production implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// One entity in the catalogue. Mirrors the `Subsystem` seam: a narrow trait
/// with associated behavior, not an inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Read-only measurement.
    Sensor,
    /// Inbound numeric setpoint.
    Number { min: i64, max: i64 },
    /// Inbound boolean.
    Switch,
    /// Inbound free-text, forwarded for diagnostic injection.
    Text,
}

#[derive(Debug, Clone)]
pub struct EntityInfo {
    pub name: &'static str,
    pub kind: EntityKind,
    pub device_class: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub enabled_by_default: bool,
    pub expire_after_s: Option<u64>,
}

impl EntityInfo {
    const fn sensor(name: &'static str) -> Self {
        Self {
            name,
            kind: EntityKind::Sensor,
            device_class: None,
            unit: None,
            state_class: None,
            enabled_by_default: true,
            expire_after_s: None,
        }
    }
}

/// Inbound command addressed to one entity: raw payload plus which entity it targets.
#[derive(Debug, Clone)]
pub struct EntityCommand {
    pub entity: String,
    pub payload: String,
}

/// Catalogue of every entity the bridge publishes. Built once at startup; see
/// [`catalogue`] for the fixed list (measurement + setpoint + diagnostic entities).
pub fn catalogue(experimental: bool) -> Vec<(&'static str, EntityInfo)> {
    let mut entities = vec![
        ("status", EntityInfo::sensor("Status")),
        (
            "current",
            EntityInfo {
                device_class: Some("current"),
                unit: Some("A"),
                state_class: Some("measurement"),
                ..EntityInfo::sensor("Current")
            },
        ),
        (
            "voltage",
            EntityInfo {
                device_class: Some("voltage"),
                unit: Some("V"),
                state_class: Some("measurement"),
                ..EntityInfo::sensor("Voltage")
            },
        ),
        (
            "frequency",
            EntityInfo {
                device_class: Some("frequency"),
                unit: Some("Hz"),
                state_class: Some("measurement"),
                ..EntityInfo::sensor("Frequency")
            },
        ),
        (
            "temperature",
            EntityInfo {
                device_class: Some("temperature"),
                unit: Some("°F"),
                state_class: Some("measurement"),
                ..EntityInfo::sensor("Temperature")
            },
        ),
        (
            "energy_lifetime",
            EntityInfo {
                device_class: Some("energy"),
                unit: Some("Wh"),
                state_class: Some("total_increasing"),
                ..EntityInfo::sensor("Energy (Lifetime)")
            },
        ),
        (
            "energy_session",
            EntityInfo {
                device_class: Some("energy"),
                unit: Some("Wh"),
                state_class: Some("total_increasing"),
                ..EntityInfo::sensor("Energy (Session)")
            },
        ),
        (
            "power",
            EntityInfo {
                device_class: Some("power"),
                unit: Some("W"),
                state_class: Some("measurement"),
                ..EntityInfo::sensor("Power")
            },
        ),
        ("interval", EntityInfo::sensor("Interval")),
        ("counter", EntityInfo::sensor("Counter")),
        (
            "current_max_online",
            EntityInfo {
                kind: EntityKind::Number { min: 0, max: 80 },
                unit: Some("A"),
                ..EntityInfo::sensor("Current Max Online")
            },
        ),
        (
            "current_max_offline",
            EntityInfo {
                kind: EntityKind::Number { min: 0, max: 80 },
                unit: Some("A"),
                ..EntityInfo::sensor("Current Max Offline")
            },
        ),
        (
            "act_as_server",
            EntityInfo {
                kind: EntityKind::Switch,
                ..EntityInfo::sensor("Act As Server")
            },
        ),
        (
            "debug_message",
            EntityInfo {
                enabled_by_default: false,
                expire_after_s: Some(60),
                ..EntityInfo::sensor("Debug Message")
            },
        ),
    ];

    if experimental {
        entities.push((
            "raw_device_frame",
            EntityInfo {
                enabled_by_default: false,
                ..EntityInfo::sensor("Raw Device Frame")
            },
        ));
        entities.push((
            "raw_cloud_frame",
            EntityInfo {
                enabled_by_default: false,
                ..EntityInfo::sensor("Raw Cloud Frame")
            },
        ));
        entities.push((
            "raw_send",
            EntityInfo {
                kind: EntityKind::Text,
                enabled_by_default: false,
                ..EntityInfo::sensor("Raw Send")
            },
        ));
    }

    entities
}

/// Settings needed to stand up the bus connection and discovery topics.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub discovery_prefix: String,
    pub device_name: String,
    pub juicebox_id: String,
}

/// Live MQTT-backed bus adapter. Owns the last-known state of every entity and
/// the inbound command channel fed by the MQTT event loop task.
pub struct MqttEntityBus {
    client: AsyncClient,
    settings: MqttSettings,
    state: Arc<Mutex<BTreeMap<String, String>>>,
    commands_tx: mpsc::Sender<EntityCommand>,
}

impl MqttEntityBus {
    /// Connects to the broker, publishes discovery config for every entity in
    /// `catalogue`, subscribes to command topics for the mutable ones, and
    /// returns the bus plus the receiving half of its inbound command channel.
    pub async fn connect(
        settings: MqttSettings,
        entities: &[(&'static str, EntityInfo)],
    ) -> (Self, mpsc::Receiver<EntityCommand>) {
        let mut options = MqttOptions::new(
            format!("juicepass-bridge-{}", settings.juicebox_id),
            settings.host.clone(),
            settings.port,
        );
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            options.set_credentials(user, pass);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (commands_tx, commands_rx) = mpsc::channel(64);

        for (key, info) in entities {
            let config_topic = discovery_config_topic(&settings, key, info.kind);
            let payload = discovery_payload(&settings, key, info);
            if let Err(e) = client
                .publish(&config_topic, QoS::AtLeastOnce, true, payload.to_string())
                .await
            {
                warn!(topic = config_topic, error = %e, "failed to publish discovery config");
            }

            if let EntityKind::Sensor = info.kind {
                continue;
            }
            let topic = command_topic(&settings, key);
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                warn!(topic, error = %e, "failed to subscribe to entity command topic");
            }
        }

        let tx = commands_tx.clone();
        let prefix = command_topic_prefix(&settings);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        if let Some(entity) = publish.topic.strip_prefix(&prefix) {
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            debug!(entity, payload, "inbound entity command");
                            let _ = tx
                                .send(EntityCommand {
                                    entity: entity.trim_start_matches('/').to_string(),
                                    payload,
                                })
                                .await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error");
                    }
                }
            }
        });

        let bus = Self {
            client,
            settings,
            state: Arc::new(Mutex::new(BTreeMap::new())),
            commands_tx,
        };
        (bus, commands_rx)
    }

    /// Idempotent last-writer-wins publish: skips the network round-trip if
    /// the value hasn't changed since the previous publish.
    pub async fn set_state(&self, entity: &str, value: impl Into<String>) {
        let value = value.into();
        let mut state = self.state.lock().await;
        if state.get(entity) == Some(&value) {
            return;
        }
        let topic = state_topic(&self.settings, entity);
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, value.as_bytes())
            .await
        {
            warn!(entity, error = %e, "failed to publish entity state");
            return;
        }
        state.insert(entity.to_string(), value);
    }

    pub async fn last_state(&self, entity: &str) -> Option<String> {
        self.state.lock().await.get(entity).cloned()
    }

    /// Exposed so startup code can seed `last_state` from the config store's
    /// persisted `<serial>_<entity>_initial_state` values before the bus opens.
    pub async fn seed_state(&self, entity: &str, value: impl Into<String>) {
        self.state.lock().await.insert(entity.to_string(), value.into());
    }

    pub fn commands(&self) -> mpsc::Sender<EntityCommand> {
        self.commands_tx.clone()
    }
}

fn state_topic(settings: &MqttSettings, entity: &str) -> String {
    format!(
        "{}/sensor/{}/{}/state",
        settings.discovery_prefix, settings.juicebox_id, entity
    )
}

fn command_topic_prefix(settings: &MqttSettings) -> String {
    format!("{}/{}/cmd/", settings.discovery_prefix, settings.juicebox_id)
}

fn command_topic(settings: &MqttSettings, entity: &str) -> String {
    format!("{}{}", command_topic_prefix(settings), entity)
}

fn ha_component(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Sensor => "sensor",
        EntityKind::Number { .. } => "number",
        EntityKind::Switch => "switch",
        EntityKind::Text => "text",
    }
}

fn discovery_config_topic(settings: &MqttSettings, entity: &str, kind: EntityKind) -> String {
    format!(
        "{}/{}/{}/{}/config",
        settings.discovery_prefix,
        ha_component(kind),
        settings.juicebox_id,
        entity
    )
}

/// Home-assistant-style discovery payload: device info plus this entity's
/// state/command topics and unit/class metadata. Unknown/absent fields are
/// simply omitted rather than published as JSON null.
fn discovery_payload(settings: &MqttSettings, entity: &str, info: &EntityInfo) -> serde_json::Value {
    let mut payload = json!({
        "name": info.name,
        "unique_id": format!("{}_{}", settings.juicebox_id, entity),
        "state_topic": state_topic(settings, entity),
        "enabled_by_default": info.enabled_by_default,
        "device": {
            "identifiers": [settings.juicebox_id],
            "name": settings.device_name,
            "manufacturer": "enelX",
            "model": "JuiceBox",
        },
    });
    let obj = payload.as_object_mut().expect("object literal");

    if !matches!(info.kind, EntityKind::Sensor) {
        obj.insert("command_topic".into(), json!(command_topic(settings, entity)));
    }
    if let Some(unit) = info.unit {
        obj.insert("unit_of_measurement".into(), json!(unit));
    }
    if let Some(class) = info.device_class {
        obj.insert("device_class".into(), json!(class));
    }
    if let Some(class) = info.state_class {
        obj.insert("state_class".into(), json!(class));
    }
    if let Some(expire) = info.expire_after_s {
        obj.insert("expire_after".into(), json!(expire));
    }
    if let EntityKind::Number { min, max } = info.kind {
        obj.insert("min".into(), json!(min));
        obj.insert("max".into(), json!(max));
    }
    if matches!(info.kind, EntityKind::Switch) {
        obj.insert("payload_on".into(), json!("on"));
        obj.insert("payload_off".into(), json!("off"));
    }

    payload
}
