// Panel Module - In-memory model of the controller's web panel
//
// Channels are typed; everything else lives in a flat map of elements keyed by
// the ids the device's own page uses, which is what the snapshot field names
// refer to.
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error};

use crate::bindings::{Binding, BindingTable, CustomBinding, UnknownFieldPolicy, UpdateStrategy};
use crate::snapshot::{is_truthy, value_text, ChannelConfig, ChannelControlIntent, DeviceSnapshot};
use crate::types::{BUTTON_COUNT, CHANNEL_COUNT};
use crate::wifi::WifiScanOutcome;

// Plain inputs the device fills from its stored configuration
const INPUT_ELEMENTS: &[&str] = &[
    "wifi_hostname",
    "wifi_ssid",
    "wifi_psk",
    "mqtt_server",
    "mqtt_port",
    "mqtt_username",
    "mqtt_psk",
    "mqtt_base_topic",
    "home_assistant_state_change_wait",
    "log_level",
    "button_min_press",
    "button_max_press",
];

const STATUS_ELEMENTS: &[&str] = &["mqtt_auth", "mqtt_status", "home_assistant_status"];

// Start hidden until a status or checkbox reveals them
const HIDDEN_ELEMENTS: &[&str] = &[
    "mqtt_connection_error",
    "home_assistant_connection_error",
    "mqtt_username_field",
    "mqtt_psk_field",
];

const CHECKBOX_ELEMENTS: &[&str] = &["mqtt_auth"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub value: String,
    pub html: String,
    pub checked: bool,
    pub disabled: bool,
    pub hidden: bool,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelView {
    pub output: String,
    pub slider: u8,
    /// Configuration from the last full snapshot; None until one arrives
    pub config: Option<ChannelConfig>,
}

impl Default for ChannelView {
    fn default() -> Self {
        ChannelView {
            output: "Off".to_string(),
            slider: 0,
            config: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonView {
    pub enabled: bool,
    pub channel: String,
    pub name: String,
    pub output: String,
    pub slider_disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum WifiView {
    #[default]
    Idle,
    Scanning,
    Done(WifiScanOutcome),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliderError {
    #[error("there is no channel slot {0}")]
    UnknownSlot(usize),
    #[error("channel slot {0} has no DMX channel yet (waiting for a full snapshot)")]
    NotConfigured(usize),
    #[error("channel slot {0} is disabled on the device")]
    Disabled(usize),
}

#[derive(Debug, Clone)]
pub struct PanelModel {
    channels: [ChannelView; CHANNEL_COUNT],
    elements: BTreeMap<String, Element>,
    full_snapshot_seen: bool,
    pub overlay_visible: bool,
    pub socket_connected: bool,
    pub wifi: WifiView,
}

impl Default for PanelModel {
    fn default() -> Self {
        Self::new()
    }
}

impl PanelModel {
    pub fn new() -> Self {
        let mut elements = BTreeMap::new();
        for id in INPUT_ELEMENTS.iter().chain(STATUS_ELEMENTS) {
            elements.insert(id.to_string(), Element::default());
        }
        for id in HIDDEN_ELEMENTS {
            elements.insert(
                id.to_string(),
                Element {
                    hidden: true,
                    ..Element::default()
                },
            );
        }
        for n in 1..=BUTTON_COUNT {
            for suffix in ["enabled", "channel", "name", "name_title", "output", "output_slider"] {
                elements.insert(format!("button{}_{}", n, suffix), Element::default());
            }
        }

        PanelModel {
            channels: Default::default(),
            elements,
            full_snapshot_seen: false,
            overlay_visible: false,
            socket_connected: false,
            wifi: WifiView::Idle,
        }
    }

    pub fn element_ids(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    fn element_mut(&mut self, id: &str) -> &mut Element {
        self.elements.entry(id.to_string()).or_default()
    }

    pub fn channels(&self) -> &[ChannelView] {
        &self.channels
    }

    pub fn channel(&self, slot: usize) -> Option<&ChannelView> {
        self.channels.get(slot)
    }

    pub fn button(&self, slot: usize) -> Option<ButtonView> {
        if slot >= BUTTON_COUNT {
            return None;
        }
        let id = |suffix: &str| format!("button{}_{}", slot + 1, suffix);
        let get = |suffix: &str| self.elements.get(&id(suffix)).cloned().unwrap_or_default();
        Some(ButtonView {
            enabled: get("enabled").checked,
            channel: get("channel").value,
            name: get("name").value,
            output: get("output").html,
            slider_disabled: get("output_slider").disabled,
        })
    }

    pub fn has_full_snapshot(&self) -> bool {
        self.full_snapshot_seen
    }

    pub fn apply_snapshot(&mut self, snapshot: &DeviceSnapshot, table: &BindingTable) {
        if let Some(channels) = &snapshot.channels {
            for (view, channel) in self.channels.iter_mut().zip(channels) {
                if channel.on {
                    view.output = channel.level.to_string();
                    view.slider = channel.level;
                } else {
                    view.output = "Off".to_string();
                    view.slider = 0;
                }
                if let Some(config) = &channel.config {
                    view.config = Some(config.clone());
                }
            }
        }

        if let Some(buttons) = &snapshot.buttons {
            for (slot, button) in buttons.iter().enumerate() {
                self.element_mut(&format!("button{}_enabled", slot + 1)).checked = button.enabled;
                self.element_mut(&format!("button{}_channel", slot + 1)).value =
                    button.channel.to_string();
            }
        }

        for (field, value) in &snapshot.fields {
            match table.resolve(field) {
                Some(binding) => self.apply_binding(&binding, value),
                None => match table.unknown_policy() {
                    UnknownFieldPolicy::LogAndSkip => {
                        error!(field = %field, "no panel element for snapshot field")
                    }
                    UnknownFieldPolicy::Ignore => {}
                },
            }
        }

        if snapshot.is_full() {
            self.full_snapshot_seen = true;
        }
        debug!(kind = ?snapshot.kind, "snapshot applied");
    }

    fn apply_binding(&mut self, binding: &Binding, value: &Value) {
        let text = value_text(value);
        let id = binding.element.as_str();
        match binding.strategy {
            UpdateStrategy::SetValue => self.element_mut(id).value = text,
            UpdateStrategy::SetHtml => self.element_mut(id).html = text,
            UpdateStrategy::SetChecked => self.element_mut(id).checked = is_truthy(value),
            UpdateStrategy::Custom(CustomBinding::ButtonOutput) => {
                let slider = self.element_mut(&format!("{}_slider", id));
                match text.as_str() {
                    "DISABLED" => slider.disabled = true,
                    "Off" => {
                        slider.disabled = false;
                        slider.value = "0".to_string();
                    }
                    level => {
                        slider.disabled = false;
                        slider.value = level.to_string();
                    }
                }
                self.element_mut(id).html = text;
            }
            UpdateStrategy::Custom(CustomBinding::ButtonName) => {
                self.element_mut(&format!("{}_title", id)).html = text.clone();
                self.element_mut(id).value = text;
            }
            UpdateStrategy::Custom(CustomBinding::MqttAuth) => {
                let checked = is_truthy(value);
                self.element_mut(id).checked = checked;
                self.element_mut("mqtt_username_field").hidden = !checked;
                self.element_mut("mqtt_psk_field").hidden = !checked;
            }
            UpdateStrategy::Custom(CustomBinding::ConnectionStatus) => {
                let connected = text == "Connected";
                let banner = format!("{}_connection_error", id.trim_end_matches("_status"));
                self.element_mut(&banner).hidden = connected;
                let tag = self.element_mut(id);
                tag.class = if connected { "tag is-success" } else { "tag is-danger" }.to_string();
                tag.html = text;
            }
        }
    }

    /// Move a channel slider and build the intent that tells the device about it
    pub fn set_slider(&mut self, slot: usize, value: u8) -> Result<ChannelControlIntent, SliderError> {
        let view = self.channels.get_mut(slot).ok_or(SliderError::UnknownSlot(slot))?;
        let config = view.config.as_ref().ok_or(SliderError::NotConfigured(slot))?;
        if !config.enabled {
            return Err(SliderError::Disabled(slot));
        }
        let intent = ChannelControlIntent {
            channel: config.channel,
            value,
        };
        view.slider = value;
        Ok(intent)
    }

    pub fn nudge_slider(&mut self, slot: usize, delta: i16) -> Result<ChannelControlIntent, SliderError> {
        let current = self
            .channels
            .get(slot)
            .ok_or(SliderError::UnknownSlot(slot))?
            .slider;
        let value = (current as i16 + delta).clamp(0, 255) as u8;
        self.set_slider(slot, value)
    }

    pub fn set_wifi(&mut self, wifi: WifiView) {
        self.wifi = wifi;
    }

    /// Override one setting before it is written back with the save-config form
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some((slot, prop)) = parse_channel_key(key) {
            let config = self.channels[slot]
                .config
                .as_mut()
                .with_context(|| format!("channel {} has no configuration yet", slot + 1))?;
            let parse_err = || format!("invalid value '{}' for {}", value, key);
            match prop {
                "enabled" => config.enabled = parse_flag(value).with_context(parse_err)?,
                "name" => config.name = value.to_string(),
                "channel" => config.channel = value.parse().with_context(parse_err)?,
                "min" => config.min = value.parse().with_context(parse_err)?,
                "max" => config.max = value.parse().with_context(parse_err)?,
                "dimmingSpeed" => config.dimming_speed = value.parse().with_context(parse_err)?,
                "autoDimmingSpeed" => {
                    config.auto_dimming_speed = value.parse().with_context(parse_err)?
                }
                "holdPeriod" => config.hold_period = value.parse().with_context(parse_err)?,
                other => bail!("unknown channel setting '{}'", other),
            }
            return Ok(());
        }

        // The form posts the MQTT password under a different name than the element
        let id = if key == "mqtt_password" { "mqtt_psk" } else { key };
        if !self.elements.contains_key(id) {
            bail!("unknown setting '{}'", key);
        }
        if id.ends_with("_enabled") || CHECKBOX_ELEMENTS.contains(&id) {
            let checked = parse_flag(value).with_context(|| format!("invalid value '{}' for {}", value, key))?;
            self.element_mut(id).checked = checked;
        } else {
            self.element_mut(id).value = value.to_string();
        }
        Ok(())
    }

    /// Form fields for POST /save_config, named as the device expects them
    pub fn config_form(&self) -> Result<Vec<(String, String)>> {
        if !self.full_snapshot_seen {
            bail!("no full snapshot received yet; refusing to save a partial configuration");
        }

        let value = |id: &str| self.elements.get(id).map(|e| e.value.clone()).unwrap_or_default();
        let mut form: Vec<(String, String)> = [
            ("wifi_hostname", "wifi_hostname"),
            ("wifi_ssid", "wifi_ssid"),
            ("wifi_psk", "wifi_psk"),
            ("log_level", "log_level"),
            ("mqtt_server", "mqtt_server"),
            ("mqtt_port", "mqtt_port"),
            ("mqtt_username", "mqtt_username"),
            ("mqtt_password", "mqtt_psk"),
            ("mqtt_base_topic", "mqtt_base_topic"),
            ("home_assistant_state_change_wait", "home_assistant_state_change_wait"),
            ("button_max_press", "button_max_press"),
            ("button_min_press", "button_min_press"),
        ]
        .iter()
        .map(|&(name, id)| (name.to_string(), value(id)))
        .collect();

        for (slot, view) in self.channels.iter().enumerate() {
            let n = slot + 1;
            let config = view
                .config
                .as_ref()
                .with_context(|| format!("channel {} has no configuration", n))?;
            // Unchecked checkboxes are simply absent from an HTML form
            if config.enabled {
                form.push((format!("channel{}_enabled", n), "on".to_string()));
            }
            form.push((format!("channel{}_name", n), config.name.clone()));
            form.push((format!("channel{}_channel", n), config.channel.to_string()));
            form.push((format!("channel{}_min", n), config.min.to_string()));
            form.push((format!("channel{}_max", n), config.max.to_string()));
            form.push((format!("channel{}_dimmingSpeed", n), config.dimming_speed.to_string()));
            form.push((
                format!("channel{}_autoDimmingSpeed", n),
                config.auto_dimming_speed.to_string(),
            ));
            form.push((format!("channel{}_holdPeriod", n), config.hold_period.to_string()));
        }

        for n in 1..=BUTTON_COUNT {
            let enabled = self
                .elements
                .get(&format!("button{}_enabled", n))
                .is_some_and(|e| e.checked);
            if enabled {
                form.push((format!("button{}_enabled", n), "on".to_string()));
            }
            form.push((format!("button{}_channel", n), value(&format!("button{}_channel", n))));
        }

        Ok(form)
    }
}

// "channel3_holdPeriod" -> (2, "holdPeriod")
fn parse_channel_key(key: &str) -> Option<(usize, &str)> {
    let rest = key.strip_prefix("channel")?;
    let (index, prop) = rest.split_once('_')?;
    let n: usize = index.parse().ok()?;
    if n == 0 || n > CHANNEL_COUNT {
        return None;
    }
    Some((n - 1, prop))
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("expected a boolean, got '{}'", other),
    }
}
